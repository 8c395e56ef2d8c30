//! Control Surface (spec §4.5): the interface a front-end (web UI, CLI
//! tool, whatever transport) drives the engine through. This module defines
//! the interface and its supporting JSON payload types; it does not bind an
//! HTTP listener itself, since the transport is out of scope here.

use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::engine::{InjectTarget, ProxyEngine, Status};
use crate::error::Result;
use crate::logger::Logger;
use crate::registry::{ClientKind, ClientRecord};

/// `status()` response body (spec §6).
#[derive(Debug, Serialize)]
pub struct StatusPayload {
    pub upstream_state: &'static str,
    pub upstream_addr: String,
    pub listen_addr: String,
    pub connected_clients: usize,
    pub max_clients: usize,
    pub start_time: String,
}

impl From<Status> for StatusPayload {
    fn from(s: Status) -> Self {
        let upstream_state = match s.upstream_state {
            crate::upstream::State::Disconnected => "disconnected",
            crate::upstream::State::Connecting => "connecting",
            crate::upstream::State::Connected => "connected",
            crate::upstream::State::Stopped => "stopped",
        };
        StatusPayload {
            upstream_state,
            upstream_addr: s.upstream_addr,
            listen_addr: s.listen_addr,
            connected_clients: s.connected_clients,
            max_clients: s.max_clients,
            start_time: s.start_time.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        }
    }
}

/// One entry of the `list_clients()` response (spec §6). `kind` is `"tcp"`
/// for a proxy client, `"web"` for a control-plane subscriber.
#[derive(Debug, Serialize)]
pub struct ClientEntry {
    pub id: String,
    pub addr: String,
    pub connected_at: String,
    pub kind: &'static str,
}

impl From<ClientRecord> for ClientEntry {
    fn from(r: ClientRecord) -> Self {
        ClientEntry {
            id: r.id,
            addr: r.addr,
            connected_at: r.connected_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            // `ClientKind::Web` is never produced by this crate (see its
            // doc comment in registry.rs) since no web transport is wired
            // up here; the arm is kept so `list_clients()` already matches
            // the two-kind payload shape §6 describes once one is added.
            kind: match r.kind {
                ClientKind::Proxy => "tcp",
                ClientKind::Web => "web",
            },
        }
    }
}

/// Body of an `inject()` request (spec §6). `data` is interpreted per
/// `format`: `"hex"` accepts an optional `0x` prefix and ignores embedded
/// whitespace; `"ascii"` is taken as literal bytes.
#[derive(Debug, Deserialize)]
pub struct InjectRequest {
    pub target: String,
    pub format: String,
    pub data: String,
}

impl InjectRequest {
    /// Decodes `data` per `format` into raw bytes to hand to `inject()`.
    pub fn decode_bytes(&self) -> Result<Vec<u8>> {
        match self.format.as_str() {
            "hex" => decode_hex_relaxed(&self.data),
            "ascii" => Ok(self.data.as_bytes().to_vec()),
            other => Err(crate::error::ProxyError::Config(format!(
                "unknown inject format: {}",
                other
            ))),
        }
    }

    pub fn target(&self) -> Result<InjectTarget> {
        InjectTarget::parse(&self.target)
    }
}

/// Parses hex text that may carry an optional `0x` prefix and arbitrary
/// interior whitespace/newlines (spec §6 "inject format: hex").
fn decode_hex_relaxed(s: &str) -> Result<Vec<u8>> {
    let trimmed = s.trim();
    let trimmed = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")).unwrap_or(trimmed);
    let cleaned: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() % 2 != 0 {
        return Err(crate::error::ProxyError::Config(
            "hex payload must have an even number of digits".into(),
        ));
    }
    hex::decode(&cleaned).map_err(|e| crate::error::ProxyError::Config(format!("invalid hex payload: {}", e)))
}

/// Depth of each subscriber's outbound queue (spec §7 "log stream backlog").
const SUBSCRIBER_QUEUE_DEPTH: usize = 10;
/// Number of historical lines replayed to a new subscriber (spec §4.5).
const HISTORY_CAP: usize = 1000;

struct HubInner {
    history: std::collections::VecDeque<String>,
    subscribers: Vec<mpsc::Sender<String>>,
}

/// Fans out every logged line to live subscribers and keeps a bounded
/// replay buffer for subscribers that join mid-stream. Installs itself as
/// the [`Logger`]'s callback.
pub struct LogHub {
    inner: SyncMutex<HubInner>,
}

impl LogHub {
    pub fn new() -> Arc<Self> {
        Arc::new(LogHub {
            inner: SyncMutex::new(HubInner {
                history: std::collections::VecDeque::with_capacity(HISTORY_CAP),
                subscribers: Vec::new(),
            }),
        })
    }

    /// Wires this hub up as the logger's subscription callback.
    pub fn install(self: &Arc<Self>, logger: &Logger) {
        let hub = self.clone();
        logger.set_callback(Some(Arc::new(move |line: String| hub.publish(line))));
    }

    fn publish(&self, line: String) {
        let mut inner = self.inner.lock();
        if inner.history.len() >= HISTORY_CAP {
            inner.history.pop_front();
        }
        inner.history.push_back(line.clone());

        // Newest-message-drop: a subscriber whose queue is full just misses
        // this line rather than blocking the publisher or the logger.
        inner.subscribers.retain(|tx| match tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Subscribes to future log lines, replaying up to [`HISTORY_CAP`]
    /// historical lines first. Dropping the returned receiver unsubscribes.
    pub fn subscribe(&self) -> (Vec<String>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let mut inner = self.inner.lock();
        inner.subscribers.push(tx);
        (inner.history.iter().cloned().collect(), rx)
    }
}

/// The operations a control-plane front-end drives the proxy through (spec
/// §4.5). Implemented directly by [`ProxyEngine`] plus the log hub; kept as
/// a trait so a future transport layer can depend on the interface alone.
#[async_trait::async_trait]
pub trait ControlSurface: Send + Sync {
    fn snapshot(&self) -> StatusPayload;
    fn list_clients(&self) -> Vec<ClientEntry>;
    async fn disconnect_client(&self, id: &str) -> Result<()>;
    async fn inject(&self, req: InjectRequest) -> Result<()>;
    fn reserve_web(&self) -> Result<()>;
    fn release_web(&self);
    fn subscribe_logs(&self) -> (Vec<String>, mpsc::Receiver<String>);
}

/// Binds a [`ProxyEngine`] and a [`LogHub`] into one [`ControlSurface`].
pub struct EngineControlSurface {
    engine: Arc<ProxyEngine>,
    log_hub: Arc<LogHub>,
}

impl EngineControlSurface {
    pub fn new(engine: Arc<ProxyEngine>, log_hub: Arc<LogHub>) -> Self {
        EngineControlSurface { engine, log_hub }
    }
}

#[async_trait::async_trait]
impl ControlSurface for EngineControlSurface {
    fn snapshot(&self) -> StatusPayload {
        self.engine.status().into()
    }

    fn list_clients(&self) -> Vec<ClientEntry> {
        self.engine.registry().list().into_iter().map(ClientEntry::from).collect()
    }

    async fn disconnect_client(&self, id: &str) -> Result<()> {
        self.engine.registry().remove(id).await;
        Ok(())
    }

    async fn inject(&self, req: InjectRequest) -> Result<()> {
        let target = req.target()?;
        let bytes = req.decode_bytes()?;
        self.engine.inject(target, &bytes).await
    }

    fn reserve_web(&self) -> Result<()> {
        self.engine.registry().reserve_web()
    }

    fn release_web(&self) {
        self.engine.registry().release_web()
    }

    fn subscribe_logs(&self) -> (Vec<String>, mpsc::Receiver<String>) {
        self.log_hub.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_hex_relaxed_accepts_prefix_and_whitespace() {
        assert_eq!(decode_hex_relaxed("0x01 02\n03").unwrap(), vec![0x01, 0x02, 0x03]);
        assert_eq!(decode_hex_relaxed("ff").unwrap(), vec![0xff]);
    }

    #[test]
    fn decode_hex_relaxed_rejects_odd_length() {
        assert!(decode_hex_relaxed("0x0").is_err());
    }

    #[test]
    fn decode_hex_relaxed_rejects_non_hex() {
        assert!(decode_hex_relaxed("zz").is_err());
    }

    #[tokio::test]
    async fn log_hub_replays_history_to_new_subscriber() {
        let hub = LogHub::new();
        hub.publish("first\n".to_string());
        hub.publish("second\n".to_string());

        let (history, mut rx) = hub.subscribe();
        assert_eq!(history, vec!["first\n".to_string(), "second\n".to_string()]);

        hub.publish("third\n".to_string());
        assert_eq!(rx.recv().await.unwrap(), "third\n");
    }

    #[tokio::test]
    async fn log_hub_drops_newest_line_when_subscriber_queue_is_full() {
        let hub = LogHub::new();
        let (_history, rx) = hub.subscribe();
        for i in 0..(SUBSCRIBER_QUEUE_DEPTH + 5) {
            hub.publish(format!("line {}\n", i));
        }
        // The subscriber is still registered (queue-full never evicts it);
        // only the newest overflow lines were dropped.
        drop(rx);
    }
}
