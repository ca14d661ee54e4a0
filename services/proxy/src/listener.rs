//! Accept loops.
//!
//! A listener accepts client connections, limits how many run at once and
//! spawns one session task per connection. Encrypted listeners wrap each
//! accepted stream in the AEAD relay stream and run the same session over
//! it.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use crate::context::ProxyContext;
use crate::parent::{AeadStream, CipherSpec};
use crate::session;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// How accepted streams are framed.
#[derive(Debug, Clone)]
pub enum ListenerKind {
    Plain,
    /// HTTP proxy traffic inside the AEAD relay stream.
    Encrypted(CipherSpec),
}

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    pub kind: ListenerKind,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            kind: ListenerKind::Plain,
        }
    }

    pub fn encrypted(bind_addr: SocketAddr, cipher: CipherSpec) -> Self {
        Self {
            kind: ListenerKind::Encrypted(cipher),
            ..Self::new(bind_addr)
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
}

/// A proxy listener.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub async fn bind(config: ListenerConfig, ctx: Arc<ProxyContext>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            encrypted = matches!(config.kind, ListenerKind::Encrypted(_)),
            "listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            ctx,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "listener started");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(bind_addr = %local_addr, "listener stopped");
                        return Ok(());
                    }
                    continue;
                }
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "connection rejected: max connections reached");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);

                    self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                    let ctx = Arc::clone(&self.ctx);
                    let stats = Arc::clone(&self.stats);
                    let kind = self.config.kind.clone();

                    tokio::spawn(
                        async move {
                            match kind {
                                ListenerKind::Plain => session::serve(ctx, stream).await,
                                ListenerKind::Encrypted(cipher) => {
                                    session::serve(ctx, AeadStream::new(stream, cipher)).await
                                }
                            }
                            debug!("connection closed");

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                    if crate::error::is_capacity_io(&e) {
                        self.ctx.pool.close_all().await;
                    }
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
