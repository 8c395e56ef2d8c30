//! Client Registry (spec §4.3): tracks active downstream peers, enforces
//! the shared capacity cap, and fans out broadcasts with per-peer isolation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{ProxyError, Result};
use crate::logger::Logger;

/// Kind of a client record (spec §3 "Client").
///
/// `Web` is part of the spec's record shape (§4.5 `list_clients()` names
/// both kinds) but this crate never constructs one: the web transport that
/// would own a control-plane subscriber connection is out of scope (§1), so
/// web subscribers exist only as the `reserved_web` counter below, not as
/// enumerable records. A future transport layer that accepts subscriber
/// connections would insert `Slot`s with this kind the same way `add` does
/// for proxy clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Proxy,
    Web,
}

/// Read-only snapshot of a registered client (spec §3 "Client").
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: String,
    pub addr: String,
    pub connected_at: DateTime<Utc>,
    pub kind: ClientKind,
}

const BROADCAST_WRITE_DEADLINE: Duration = Duration::from_millis(100);

struct Slot {
    record: ClientRecord,
    write_half: Arc<AsyncMutex<OwnedWriteHalf>>,
}

struct Inner {
    clients: HashMap<String, Slot>,
    next_id: u64,
    total_count: u64,
    reserved_web: usize,
}

/// Tracks active proxy clients and web-subscriber capacity reservations.
pub struct ClientRegistry {
    max_clients: usize,
    inner: SyncMutex<Inner>,
    logger: Arc<Logger>,
}

impl ClientRegistry {
    pub fn new(max_clients: usize, logger: Arc<Logger>) -> Self {
        ClientRegistry {
            max_clients,
            inner: SyncMutex::new(Inner {
                clients: HashMap::new(),
                next_id: 0,
                total_count: 0,
                reserved_web: 0,
            }),
            logger,
        }
    }

    /// Registers a newly accepted proxy client. Splits the stream, stores
    /// the write half, and returns the assigned id plus the read half for
    /// the engine's per-client read pump. Fails with `CapacityExceeded`
    /// without registering or closing `stream` (the caller is responsible
    /// for closing it on that path).
    pub fn add(&self, stream: TcpStream, addr: String) -> Result<(String, OwnedReadHalf)> {
        let mut inner = self.inner.lock();
        if inner.clients.len() + inner.reserved_web >= self.max_clients {
            return Err(ProxyError::CapacityExceeded);
        }

        let id = format!("client#{}", inner.next_id);
        inner.next_id += 1;
        inner.total_count += 1;

        let (read_half, write_half) = stream.into_split();
        inner.clients.insert(
            id.clone(),
            Slot {
                record: ClientRecord {
                    id: id.clone(),
                    addr,
                    connected_at: Utc::now(),
                    kind: ClientKind::Proxy,
                },
                write_half: Arc::new(AsyncMutex::new(write_half)),
            },
        );
        Ok((id, read_half))
    }

    /// Closes the handle (once) and removes the record. No-op if absent.
    pub async fn remove(&self, id: &str) {
        let slot = self.inner.lock().clients.remove(id);
        if let Some(slot) = slot {
            let mut half = slot.write_half.lock().await;
            let _ = half.shutdown().await;
        }
    }

    pub fn get(&self, id: &str) -> Option<ClientRecord> {
        self.inner.lock().clients.get(id).map(|s| s.record.clone())
    }

    pub fn list(&self) -> Vec<ClientRecord> {
        self.inner.lock().clients.values().map(|s| s.record.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn total_count(&self) -> u64 {
        self.inner.lock().total_count
    }

    /// Atomically increments the web-subscriber counter if capacity
    /// allows; fails with `CapacityExceeded` otherwise.
    pub fn reserve_web(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.clients.len() + inner.reserved_web >= self.max_clients {
            return Err(ProxyError::CapacityExceeded);
        }
        inner.reserved_web += 1;
        Ok(())
    }

    /// Decrements the web-subscriber counter. Never goes negative; a
    /// release when the counter is already zero is a no-op.
    pub fn release_web(&self) {
        let mut inner = self.inner.lock();
        if inner.reserved_web > 0 {
            inner.reserved_web -= 1;
        }
    }

    pub fn reserved_web(&self) -> usize {
        self.inner.lock().reserved_web
    }

    /// Writes `bytes` to every currently registered proxy client with a
    /// 100ms per-peer deadline. Peers whose write fails are evicted after
    /// the full iteration completes, so one slow peer never blocks
    /// delivery to the others.
    pub async fn broadcast(&self, bytes: &[u8]) {
        let snapshot: Vec<(String, Arc<AsyncMutex<OwnedWriteHalf>>)> = {
            let inner = self.inner.lock();
            inner
                .clients
                .iter()
                .map(|(id, slot)| (id.clone(), slot.write_half.clone()))
                .collect()
        };

        let mut failed = Vec::new();
        for (id, write_half) in snapshot {
            let mut half = write_half.lock().await;
            let result = tokio::time::timeout(BROADCAST_WRITE_DEADLINE, half.write_all(bytes)).await;
            drop(half);
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.logger.warn(&format!("broadcast write to {} failed: {}", id, e));
                    failed.push(id);
                }
                Err(_) => {
                    self.logger
                        .warn(&format!("broadcast write to {} exceeded 100ms deadline", id));
                    failed.push(id);
                }
            }
        }

        for id in failed {
            self.remove(&id).await;
        }
    }

    /// Closes and removes every proxy client; emits one summary log line.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.inner.lock().clients.keys().cloned().collect();
        let count = ids.len();
        for id in ids {
            self.remove(&id).await;
        }
        self.logger.info(&format!("closed {} client connection(s)", count));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_logger() -> Arc<Logger> {
        Logger::new(false, None).unwrap()
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn add_assigns_monotonic_ids_and_enforces_cap() {
        let registry = ClientRegistry::new(2, test_logger());
        let (_a, server_a) = connected_pair().await;
        let (_b, server_b) = connected_pair().await;
        let (_c, server_c) = connected_pair().await;

        let (id1, _r1) = registry.add(server_a, "peer1".into()).unwrap();
        let (id2, _r2) = registry.add(server_b, "peer2".into()).unwrap();
        assert_eq!(id1, "client#0");
        assert_eq!(id2, "client#1");
        assert_eq!(registry.count(), 2);

        let err = registry.add(server_c, "peer3".into()).unwrap_err();
        assert!(matches!(err, ProxyError::CapacityExceeded));
        assert_eq!(registry.count(), 2);
    }

    #[tokio::test]
    async fn broadcast_delivers_to_all_connected_peers() {
        let registry = ClientRegistry::new(10, test_logger());
        let (mut client_a, server_a) = connected_pair().await;
        let (mut client_b, server_b) = connected_pair().await;
        registry.add(server_a, "a".into()).unwrap();
        registry.add(server_b, "b".into()).unwrap();

        registry.broadcast(b"hello").await;

        let mut buf = [0u8; 5];
        client_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        client_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ClientRegistry::new(10, test_logger());
        let (_client, server) = connected_pair().await;
        let (id, _read_half) = registry.add(server, "a".into()).unwrap();
        registry.remove(&id).await;
        assert_eq!(registry.count(), 0);
        registry.remove(&id).await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn release_web_at_zero_stays_at_zero() {
        let registry = ClientRegistry::new(10, test_logger());
        registry.release_web();
        assert_eq!(registry.reserved_web(), 0);
    }

    #[tokio::test]
    async fn reserve_web_competes_with_proxy_clients_for_cap() {
        let registry = ClientRegistry::new(1, test_logger());
        registry.reserve_web().unwrap();
        let (_client, server) = connected_pair().await;
        let err = registry.add(server, "a".into()).unwrap_err();
        assert!(matches!(err, ProxyError::CapacityExceeded));
        registry.release_web();
        let (_client2, server2) = connected_pair().await;
        registry.add(server2, "a".into()).unwrap();
    }

    #[tokio::test]
    async fn slow_peer_is_evicted_fast_peer_still_served() {
        let registry = ClientRegistry::new(10, test_logger());
        let (mut fast_client, fast_server) = connected_pair().await;
        // A peer whose socket buffer we never drain and that we don't read
        // from plays the role of a "slow" consumer once enough data has
        // been written to fill the kernel buffer; for a unit test we
        // simulate the failure path directly by dropping the client side
        // so writes to its half start failing.
        let (slow_client, slow_server) = connected_pair().await;
        drop(slow_client);

        registry.add(fast_server, "fast".into()).unwrap();
        registry.add(slow_server, "slow".into()).unwrap();

        // Repeated broadcasts should eventually evict the slow peer while
        // the fast peer keeps receiving data.
        for _ in 0..5 {
            registry.broadcast(b"ping").await;
        }

        let mut buf = [0u8; 4];
        fast_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(registry.count(), 1);
    }
}
