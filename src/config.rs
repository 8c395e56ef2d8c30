//! Configuration loading and validation (spec §3, §6).
//!
//! Precedence is defaults -> options file -> environment -> CLI flags,
//! lowest to highest. Each layer only overrides fields it actually sets;
//! an unset CLI flag is `None`, not the default, so it doesn't clobber a
//! value supplied by the file or the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::{ProxyError, Result};

/// Fully resolved, immutable configuration (spec §3 "Configuration").
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_host: String,
    pub upstream_port: u16,
    pub listen_port: u16,
    pub max_clients: usize,
    pub log_packets: bool,
    pub log_file: Option<PathBuf>,
    pub web_port: u16,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Config {
    pub fn upstream_addr(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }

    fn validate(self) -> Result<Self> {
        if self.upstream_host.trim().is_empty() {
            return Err(ProxyError::Config("upstream_host must be non-empty".into()));
        }
        if self.upstream_port == 0 {
            return Err(ProxyError::Config("upstream_port must be in 1..65535, got 0".into()));
        }
        if self.listen_port == 0 {
            return Err(ProxyError::Config("listen_port must be in 1..65535, got 0".into()));
        }
        if self.web_port == 0 {
            return Err(ProxyError::Config("web_port must be in 1..65535, got 0".into()));
        }
        if !(1..=100).contains(&self.max_clients) {
            return Err(ProxyError::Config(format!(
                "max_clients must be in 1..100, got {}",
                self.max_clients
            )));
        }
        if self.reconnect_initial.is_zero() {
            return Err(ProxyError::Config("reconnect_delay must be > 0".into()));
        }
        Ok(self)
    }
}

/// Layer parsed from an optional TOML options file. Every field is
/// optional so a partial file only overrides what it names.
#[derive(Debug, Default, Deserialize)]
struct FileLayer {
    upstream_host: Option<String>,
    upstream_port: Option<u16>,
    listen_port: Option<u16>,
    max_clients: Option<usize>,
    log_packets: Option<bool>,
    log_file: Option<String>,
    web_port: Option<u16>,
    reconnect_delay_secs: Option<u64>,
}

/// Layer read from the process environment. Variable names are prefixed
/// `SERIALPROXY_` to avoid colliding with unrelated process environment.
#[derive(Debug, Default)]
struct EnvLayer {
    upstream_host: Option<String>,
    upstream_port: Option<u16>,
    listen_port: Option<u16>,
    max_clients: Option<usize>,
    log_packets: Option<bool>,
    log_file: Option<String>,
    web_port: Option<u16>,
    reconnect_delay_secs: Option<u64>,
}

impl EnvLayer {
    fn from_process_env() -> Self {
        Self {
            upstream_host: std::env::var("SERIALPROXY_UPSTREAM_HOST").ok(),
            upstream_port: std::env::var("SERIALPROXY_UPSTREAM_PORT")
                .ok()
                .and_then(|v| v.parse().ok()),
            listen_port: std::env::var("SERIALPROXY_LISTEN_PORT")
                .ok()
                .and_then(|v| v.parse().ok()),
            max_clients: std::env::var("SERIALPROXY_MAX_CLIENTS")
                .ok()
                .and_then(|v| v.parse().ok()),
            log_packets: std::env::var("SERIALPROXY_LOG_PACKETS")
                .ok()
                .and_then(|v| v.parse().ok()),
            log_file: std::env::var("SERIALPROXY_LOG_FILE").ok(),
            web_port: std::env::var("SERIALPROXY_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok()),
            reconnect_delay_secs: std::env::var("SERIALPROXY_RECONNECT_DELAY")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

/// Command-line invocation of the proxy. Mirrors the teacher's
/// `#[derive(Parser)]` `CmdOptions`, extended with the fields this spec's
/// configuration table (§6) requires plus an optional options file.
#[derive(Parser, Debug)]
#[clap(about = "Transparent TCP fan-out proxy for a shared serial-to-TCP bridge")]
pub struct CmdOptions {
    /// Path to a TOML options file. Values it sets are overridden by
    /// environment variables and CLI flags.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host of the upstream serial-to-TCP bridge.
    #[arg(long)]
    upstream_host: Option<String>,

    /// Port of the upstream serial-to-TCP bridge.
    #[arg(long)]
    upstream_port: Option<u16>,

    /// Local port to accept proxy client connections on.
    #[arg(long)]
    listen_port: Option<u16>,

    /// Maximum concurrent downstream connections (proxy + control-plane).
    #[arg(long)]
    max_clients: Option<usize>,

    /// Emit inbound/outbound bytes to the hex packet log.
    #[arg(long)]
    log_packets: bool,

    /// Append-only file sink for the hex packet log.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Port the control-plane web UI would bind (accepted for completeness;
    /// the web server itself is out of scope for this crate).
    #[arg(long)]
    web_port: Option<u16>,

    /// Initial backoff, in seconds, before the first reconnect attempt.
    #[arg(long)]
    reconnect_delay: Option<u64>,
}

const DEFAULT_UPSTREAM_PORT: u16 = 8899;
const DEFAULT_LISTEN_PORT: u16 = 18899;
const DEFAULT_MAX_CLIENTS: usize = 10;
const DEFAULT_LOG_FILE: &str = "/data/packets.log";
const DEFAULT_WEB_PORT: u16 = 18080;
const DEFAULT_RECONNECT_INITIAL_SECS: u64 = 1;
const DEFAULT_RECONNECT_MAX_SECS: u64 = 30;

/// Loads configuration by layering defaults, an optional file, the
/// environment, and CLI flags, in that order of increasing precedence.
pub fn load(opts: CmdOptions) -> Result<Config> {
    let file = match &opts.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                ProxyError::Config(format!("could not read {}: {}", path.display(), e))
            })?;
            toml::from_str::<FileLayer>(&text)
                .map_err(|e| ProxyError::Config(format!("invalid config file: {}", e)))?
        }
        None => FileLayer::default(),
    };
    let env = EnvLayer::from_process_env();

    let upstream_host = opts
        .upstream_host
        .or(env.upstream_host)
        .or(file.upstream_host)
        .ok_or_else(|| ProxyError::Config("upstream_host is required".into()))?;

    let upstream_port = opts
        .upstream_port
        .or(env.upstream_port)
        .or(file.upstream_port)
        .unwrap_or(DEFAULT_UPSTREAM_PORT);

    let listen_port = opts
        .listen_port
        .or(env.listen_port)
        .or(file.listen_port)
        .unwrap_or(DEFAULT_LISTEN_PORT);

    let max_clients = opts
        .max_clients
        .or(env.max_clients)
        .or(file.max_clients)
        .unwrap_or(DEFAULT_MAX_CLIENTS);

    let log_packets = opts.log_packets || env.log_packets.unwrap_or(false) || file.log_packets.unwrap_or(false);

    let log_file = opts
        .log_file
        .map(|p| p.to_string_lossy().into_owned())
        .or(env.log_file)
        .or(file.log_file)
        .unwrap_or_else(|| DEFAULT_LOG_FILE.to_string());
    let log_file = if log_file.is_empty() {
        None
    } else {
        Some(PathBuf::from(log_file))
    };

    let web_port = opts
        .web_port
        .or(env.web_port)
        .or(file.web_port)
        .unwrap_or(DEFAULT_WEB_PORT);

    let reconnect_initial_secs = opts
        .reconnect_delay
        .or(env.reconnect_delay_secs)
        .or(file.reconnect_delay_secs)
        .unwrap_or(DEFAULT_RECONNECT_INITIAL_SECS);

    let config = Config {
        upstream_host,
        upstream_port,
        listen_port,
        max_clients,
        log_packets,
        log_file,
        web_port,
        reconnect_initial: Duration::from_secs(reconnect_initial_secs),
        reconnect_max: Duration::from_secs(DEFAULT_RECONNECT_MAX_SECS),
    };
    config.validate()
}
