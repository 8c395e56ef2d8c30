//! Proxy Engine (spec §4.4): owns the listening socket, drives accept,
//! spawns per-client read pumps, wires the upstream inbound sink into the
//! registry broadcast, and performs cooperative shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::logger::{Direction, Logger};
use crate::registry::ClientRegistry;
use crate::upstream::{self, UpstreamConnector};

const ACCEPT_DEADLINE: Duration = Duration::from_secs(1);
const CLIENT_READ_DEADLINE: Duration = Duration::from_secs(60);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Where an injected buffer should be routed (spec §4.4 `inject`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectTarget {
    Upstream,
    Downstream,
}

impl InjectTarget {
    /// Parses the `target` field of an inject request (spec §6).
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "upstream" => Ok(InjectTarget::Upstream),
            "downstream" => Ok(InjectTarget::Downstream),
            other => Err(ProxyError::InvalidTarget(other.to_string())),
        }
    }
}

/// Snapshot of engine status (spec §4.4 `status()`, §6 Status payload).
#[derive(Debug, Clone)]
pub struct Status {
    pub upstream_state: upstream::State,
    pub upstream_addr: String,
    pub listen_addr: String,
    pub connected_clients: usize,
    pub max_clients: usize,
    pub start_time: DateTime<Utc>,
}

pub struct ProxyEngine {
    config: Config,
    registry: Arc<ClientRegistry>,
    upstream: Arc<UpstreamConnector>,
    logger: Arc<Logger>,
    client_pool: Arc<BufferPool>,
    start_time: DateTime<Utc>,
    listening: AtomicBool,
    accept_shutdown: Arc<Notify>,
    client_shutdown: Arc<Notify>,
    accept_task: SyncMutex<Option<JoinHandle<()>>>,
    client_tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl ProxyEngine {
    pub fn new(config: Config, logger: Arc<Logger>) -> Arc<Self> {
        let registry = Arc::new(ClientRegistry::new(config.max_clients, logger.clone()));
        let upstream_pool = Arc::new(BufferPool::new(4096));
        let client_pool = Arc::new(BufferPool::new(4096));

        let sink_registry = registry.clone();
        let sink_logger = logger.clone();
        let sink: upstream::InboundSink = Arc::new(move |bytes: Vec<u8>| {
            let registry = sink_registry.clone();
            let logger = sink_logger.clone();
            Box::pin(async move {
                logger.log_packet(Direction::UpToClients, &bytes, None);
                registry.broadcast(&bytes).await;
            })
        });

        let upstream = UpstreamConnector::new(
            config.upstream_addr(),
            config.reconnect_initial,
            config.reconnect_max,
            upstream_pool,
            logger.clone(),
            sink,
        );

        Arc::new(ProxyEngine {
            config,
            registry,
            upstream,
            logger,
            client_pool,
            start_time: Utc::now(),
            listening: AtomicBool::new(false),
            accept_shutdown: Arc::new(Notify::new()),
            client_shutdown: Arc::new(Notify::new()),
            accept_task: SyncMutex::new(None),
            client_tasks: SyncMutex::new(Vec::new()),
        })
    }

    /// Begins the upstream connector, binds and listens, and begins the
    /// accept loop. Returns the first error that prevents listening.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.upstream.start();

        let listen_addr = self.config.listen_addr();
        let listener = TcpListener::bind(&listen_addr)
            .await
            .map_err(|e| ProxyError::BindFailed { addr: listen_addr.clone(), source: e })?;
        self.listening.store(true, Ordering::SeqCst);
        self.logger.info(&format!("listening on {}", listen_addr));

        let me = self.clone();
        let handle = tokio::spawn(async move { me.accept_loop(listener).await });
        *self.accept_task.lock() = Some(handle);
        Ok(())
    }

    /// Initiates graceful shutdown: stop accepting, give existing client
    /// pumps a 5-second drain window, then force-close all clients, stop
    /// the upstream connector, and close the logger. Idempotent.
    pub async fn stop(self: &Arc<Self>) {
        if !self.listening.swap(false, Ordering::SeqCst) {
            // Already stopped (or never started); still make sure the
            // upstream connector and logger wind down.
            self.upstream.stop().await;
            self.logger.close();
            return;
        }

        self.accept_shutdown.notify_waiters();
        if let Some(handle) = self.accept_task.lock().take() {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
        while self.registry.count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.client_shutdown.notify_waiters();
        self.registry.close_all().await;

        let handles = std::mem::take(&mut *self.client_tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }

        self.upstream.stop().await;
        self.logger.close();
    }

    pub fn status(&self) -> Status {
        Status {
            upstream_state: self.upstream.state(),
            upstream_addr: self.config.upstream_addr(),
            listen_addr: self.config.listen_addr(),
            connected_clients: self.registry.count(),
            max_clients: self.config.max_clients,
            start_time: self.start_time,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn is_upstream_connected(&self) -> bool {
        self.upstream.is_connected()
    }

    pub fn get_start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn get_upstream_last_connected(&self) -> Option<DateTime<Utc>> {
        self.upstream.last_connected_at()
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Routes `bytes` as if they had arrived from the indicated side,
    /// logging a packet record tagged with source `INJECT`.
    pub async fn inject(&self, target: InjectTarget, bytes: &[u8]) -> Result<()> {
        match target {
            InjectTarget::Upstream => {
                if !self.upstream.is_connected() {
                    return Err(ProxyError::Disconnected);
                }
                self.logger.log_packet(Direction::ClientToUp, bytes, Some("INJECT"));
                self.upstream.write(bytes).await
            }
            InjectTarget::Downstream => {
                self.logger.log_packet(Direction::UpToClients, bytes, Some("INJECT"));
                self.registry.broadcast(bytes).await;
                Ok(())
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.accept_shutdown.notified() => return,
                res = tokio::time::timeout(ACCEPT_DEADLINE, listener.accept()) => {
                    match res {
                        Ok(Ok((stream, addr))) => self.handle_accept(stream, addr.to_string()),
                        Ok(Err(e)) => {
                            self.logger.warn(&format!("accept error: {}", e));
                        }
                        Err(_) => {} // deadline elapsed, loop back to re-check shutdown
                    }
                }
            }
        }
    }

    fn handle_accept(self: &Arc<Self>, stream: TcpStream, addr: String) {
        match self.registry.add(stream, addr.clone()) {
            Ok((id, read_half)) => {
                self.logger.info(&format!("{} connected from {}", id, addr));
                let me = self.clone();
                let shutdown = self.client_shutdown.clone();
                let handle = tokio::spawn(async move {
                    me.client_read_pump(id, read_half, shutdown).await;
                });
                let mut tasks = self.client_tasks.lock();
                tasks.retain(|h| !h.is_finished());
                tasks.push(handle);
            }
            Err(ProxyError::CapacityExceeded) => {
                self.logger.warn(&format!("rejected {} (max_clients reached)", addr));
            }
            Err(e) => {
                self.logger.warn(&format!("failed to register {}: {}", addr, e));
            }
        }
    }

    async fn client_read_pump(
        self: Arc<Self>,
        id: String,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        shutdown: Arc<Notify>,
    ) {
        use tokio::io::AsyncReadExt;

        loop {
            let mut buf = self.client_pool.acquire();
            tokio::select! {
                _ = shutdown.notified() => break,
                res = tokio::time::timeout(CLIENT_READ_DEADLINE, read_half.read(&mut buf)) => {
                    match res {
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => {
                            let owned = buf[..n].to_vec();
                            drop(buf);
                            self.logger.log_packet(Direction::ClientToUp, &owned, Some(&id));
                            if self.upstream.is_connected() {
                                if let Err(e) = self.upstream.write(&owned).await {
                                    self.logger.warn(&format!(
                                        "upstream write failed forwarding from {}: {}",
                                        id, e
                                    ));
                                }
                            } else {
                                self.logger.warn(&format!(
                                    "upstream not connected, dropping {} byte(s) from {}",
                                    owned.len(),
                                    id
                                ));
                            }
                        }
                        Ok(Err(_)) => break,
                        Err(_) => {
                            self.logger.warn(&format!("{} read deadline exceeded", id));
                            break;
                        }
                    }
                }
            }
        }

        self.registry.remove(&id).await;
        self.logger.info(&format!("{} disconnected", id));
    }
}
