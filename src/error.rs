//! Error kinds shared across the proxy engine (spec §7).

use std::io;

/// Errors surfaced at the public boundaries of the engine, registry, and
/// upstream connector.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Fatal at startup: config file or environment could not be loaded or
    /// failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Fatal at startup: the listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    BindFailed { addr: String, source: io::Error },

    /// Surfaced from `UpstreamConnector::write` when no live handle exists.
    #[error("upstream is not connected")]
    Disconnected,

    /// Surfaced from `ClientRegistry::add` / `reserve_web` when the shared
    /// cap is already saturated.
    #[error("capacity exceeded (max_clients reached)")]
    CapacityExceeded,

    /// Internal to `broadcast`; never escapes the registry, listed here so
    /// callers matching on `ProxyError` see the full kind set described by
    /// the spec.
    #[error("write to peer failed")]
    PeerWriteFailed,

    /// Surfaced from `inject()` for any target other than `upstream` or
    /// `downstream`.
    #[error("invalid injection target: {0}")]
    InvalidTarget(String),

    /// Catch-all for network/file I/O errors reported at the boundary where
    /// they are observed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
