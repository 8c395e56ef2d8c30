//! Upstream Connector (spec §4.2): owns the single TCP connection to the
//! remote serial bridge, runs the reconnect loop, and serializes writes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::buffer_pool::BufferPool;
use crate::error::{ProxyError, Result};
use crate::logger::Logger;

/// Upstream connection state (spec §3 "Upstream state").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// Invoked with an independently-owned copy of each non-empty read, and
/// awaited before the next read is issued so that a single upstream read
/// loop serializes delivery into whatever the sink does (e.g. broadcast) —
/// this is what lets the engine promise that peers observe broadcast K-1
/// in full before any byte of broadcast K (spec §5). Must not be called
/// while the connector holds any internal lock.
pub type InboundSink =
    Arc<dyn Fn(Vec<u8>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

struct StateInner {
    state: State,
    last_connected_at: Option<DateTime<Utc>>,
    backoff: Duration,
}

pub struct UpstreamConnector {
    addr: String,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    state: SyncMutex<StateInner>,
    write_half: AsyncMutex<Option<OwnedWriteHalf>>,
    sink: InboundSink,
    pool: Arc<BufferPool>,
    logger: Arc<Logger>,
    shutdown: Notify,
    task: SyncMutex<Option<JoinHandle<()>>>,
}

impl UpstreamConnector {
    pub fn new(
        addr: String,
        reconnect_initial: Duration,
        reconnect_max: Duration,
        pool: Arc<BufferPool>,
        logger: Arc<Logger>,
        sink: InboundSink,
    ) -> Arc<Self> {
        Arc::new(UpstreamConnector {
            addr,
            reconnect_initial,
            reconnect_max,
            state: SyncMutex::new(StateInner {
                state: State::Disconnected,
                last_connected_at: None,
                backoff: reconnect_initial,
            }),
            write_half: AsyncMutex::new(None),
            sink,
            pool,
            logger,
            shutdown: Notify::new(),
            task: SyncMutex::new(None),
        })
    }

    /// Begins the reconnect loop. Non-blocking; idempotent if called twice
    /// (a second call replaces the stored task handle without affecting
    /// the already-running loop).
    pub fn start(self: &Arc<Self>) {
        let me = self.clone();
        let handle = tokio::spawn(async move { me.connection_loop().await });
        *self.task.lock() = Some(handle);
    }

    /// Transitions to Stopped, closes the handle, and waits for the loop
    /// and read pump to observe termination. Idempotent.
    pub async fn stop(self: &Arc<Self>) {
        let already_stopped = {
            let mut inner = self.state.lock();
            let was = inner.state == State::Stopped;
            inner.state = State::Stopped;
            was
        };
        self.shutdown.notify_waiters();

        if already_stopped {
            return;
        }

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn state(&self) -> State {
        self.state.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_connected_at
    }

    /// Writes the entire buffer with a 5-second deadline. Concurrent
    /// callers are serialized by the write-half mutex so write boundaries
    /// are preserved. Fails with `Disconnected` if there's no live handle.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.write_half.lock().await;
        let half = guard.as_mut().ok_or(ProxyError::Disconnected)?;
        match tokio::time::timeout(WRITE_DEADLINE, half.write_all(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProxyError::Io(e)),
            Err(_) => Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "upstream write deadline exceeded",
            ))),
        }
    }

    async fn connection_loop(self: Arc<Self>) {
        loop {
            if self.state.lock().state == State::Stopped {
                return;
            }

            self.set_state(State::Connecting);
            self.logger.info(&format!("connecting to upstream {}", self.addr));

            let dial = tokio::select! {
                _ = self.shutdown.notified() => return,
                res = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr)) => res,
            };

            let stream = match dial {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    self.logger.warn(&format!("dial to {} failed: {}", self.addr, e));
                    if !self.backoff_and_wait().await {
                        return;
                    }
                    continue;
                }
                Err(_) => {
                    self.logger.warn(&format!("dial to {} timed out", self.addr));
                    if !self.backoff_and_wait().await {
                        return;
                    }
                    continue;
                }
            };

            let (read_half, write_half) = stream.into_split();
            *self.write_half.lock().await = Some(write_half);

            {
                let mut inner = self.state.lock();
                inner.state = State::Connected;
                inner.last_connected_at = Some(Utc::now());
                inner.backoff = self.reconnect_initial;
            }
            self.logger.info(&format!("connected to upstream {}", self.addr));

            self.read_pump(read_half).await;

            *self.write_half.lock().await = None;

            if self.state.lock().state == State::Stopped {
                return;
            }
            self.set_state(State::Disconnected);
            self.logger.warn(&format!("upstream {} connection lost", self.addr));
        }
    }

    async fn read_pump(&self, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        loop {
            let mut buf = self.pool.acquire();
            tokio::select! {
                _ = self.shutdown.notified() => return,
                res = tokio::time::timeout(READ_DEADLINE, read_half.read(&mut buf)) => {
                    match res {
                        Ok(Ok(0)) => return,
                        Ok(Ok(n)) => {
                            let owned = buf[..n].to_vec();
                            drop(buf);
                            (self.sink)(owned).await;
                        }
                        Ok(Err(_)) => return,
                        Err(_) => {
                            self.logger.warn("upstream read deadline exceeded, reconnecting");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Sleeps for the current backoff (observing shutdown), then doubles it
    /// capped at `reconnect_max`. Returns false if shutdown fired.
    async fn backoff_and_wait(&self) -> bool {
        let backoff = self.state.lock().backoff;
        tokio::select! {
            _ = self.shutdown.notified() => false,
            _ = tokio::time::sleep(backoff) => {
                let mut inner = self.state.lock();
                if inner.state != State::Stopped {
                    inner.state = State::Disconnected;
                }
                inner.backoff = std::cmp::min(inner.backoff * 2, self.reconnect_max);
                true
            }
        }
    }

    fn set_state(&self, state: State) {
        let mut inner = self.state.lock();
        if inner.state != State::Stopped {
            inner.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn test_logger() -> Arc<Logger> {
        Logger::new(false, None).unwrap()
    }

    fn noop_sink() -> InboundSink {
        Arc::new(|_bytes| Box::pin(async {}))
    }

    #[tokio::test]
    async fn write_before_connected_fails_with_disconnected() {
        let pool = Arc::new(BufferPool::new(4096));
        let connector = UpstreamConnector::new(
            "127.0.0.1:1".into(),
            Duration::from_millis(10),
            Duration::from_millis(50),
            pool,
            test_logger(),
            noop_sink(),
        );
        let err = connector.write(b"hi").await.unwrap_err();
        assert!(matches!(err, ProxyError::Disconnected));
    }

    #[tokio::test]
    async fn connects_and_delivers_bytes_to_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hello").await.unwrap();
        });

        let received = Arc::new(AsyncMutex::new(Vec::new()));
        let received_clone = received.clone();
        let pool = Arc::new(BufferPool::new(4096));
        let connector = UpstreamConnector::new(
            addr.to_string(),
            Duration::from_millis(50),
            Duration::from_millis(200),
            pool,
            test_logger(),
            Arc::new(move |bytes: Vec<u8>| {
                let received_clone = received_clone.clone();
                Box::pin(async move {
                    received_clone.lock().await.extend_from_slice(&bytes);
                })
            }),
        );
        connector.start();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if !received.lock().await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(&received.lock().await[..], b"hello");
        assert!(connector.is_connected());
        connector.stop().await;
        assert_eq!(connector.state(), State::Stopped);
    }

    #[tokio::test]
    async fn reconnects_after_upstream_drops() {
        let accept_count = Arc::new(AtomicUsize::new(0));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_count_clone = accept_count.clone();

        tokio::spawn(async move {
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                accept_count_clone.fetch_add(1, Ordering::SeqCst);
                drop(sock);
            }
        });

        let pool = Arc::new(BufferPool::new(4096));
        let connector = UpstreamConnector::new(
            addr.to_string(),
            Duration::from_millis(20),
            Duration::from_millis(100),
            pool,
            test_logger(),
            noop_sink(),
        );
        connector.start();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if accept_count.load(Ordering::SeqCst) >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        connector.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let pool = Arc::new(BufferPool::new(4096));
        let connector = UpstreamConnector::new(
            "127.0.0.1:1".into(),
            Duration::from_millis(10),
            Duration::from_millis(50),
            pool,
            test_logger(),
            noop_sink(),
        );
        connector.start();
        connector.stop().await;
        connector.stop().await;
        assert_eq!(connector.state(), State::Stopped);
    }
}
