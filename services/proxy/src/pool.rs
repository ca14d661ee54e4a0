//! Idle upstream connection pool.
//!
//! Connections are queued per `host:port` key in a bounded channel. The
//! pool never waits: `get` returns `None` rather than block, and `put` drops
//! the connection when its queue is full. Each key gets a sweep task that
//! closes expired connections and removes the key once its queue drains.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Maximum idle connections per key.
pub const DEFAULT_CAPACITY: usize = 20;

/// Interval between expiry sweeps of one key.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Grace period after a key is removed, for connections put concurrently.
pub const DEFAULT_FINAL_SWEEP_DELAY: Duration = Duration::from_secs(2);

/// A connection that can sit in the pool.
pub trait Poolable: Send + 'static {
    /// The `host:port` key this connection serves.
    fn pool_key(&self) -> &str;

    /// Whether the connection must not be reused at `now`.
    fn is_expired(&self, now: Instant) -> bool;
}

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: usize,
    pub sweep_interval: Duration,
    pub final_sweep_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            final_sweep_delay: DEFAULT_FINAL_SWEEP_DELAY,
        }
    }
}

struct IdleQueue<C> {
    tx: mpsc::Sender<C>,
    rx: Mutex<mpsc::Receiver<C>>,
}

impl<C> IdleQueue<C> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Drop everything queued. Returns how many connections were closed.
    async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut closed = 0;
        while rx.try_recv().is_ok() {
            closed += 1;
        }
        closed
    }
}

struct PoolInner<C> {
    config: PoolConfig,
    queues: RwLock<HashMap<String, Arc<IdleQueue<C>>>>,
}

/// Pool of idle upstream connections keyed by `host:port`.
pub struct ConnPool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for ConnPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Poolable> ConnPool<C> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                queues: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Take an unexpired idle connection for `key`, if any.
    pub async fn get(&self, key: &str) -> Option<C> {
        let queue = self.inner.queues.read().await.get(key).cloned()?;
        let mut rx = queue.rx.lock().await;
        while let Ok(conn) = rx.try_recv() {
            if conn.is_expired(Instant::now()) {
                debug!(key = %key, "dropping expired pooled connection");
                continue;
            }
            debug!(key = %key, "reusing pooled connection");
            return Some(conn);
        }
        None
    }

    /// Return a connection to the pool. Expired connections and connections
    /// for a full key are closed.
    pub async fn put(&self, conn: C) {
        if conn.is_expired(Instant::now()) {
            return;
        }
        let key = conn.pool_key().to_string();
        let queue = self.queue_for(&key).await;
        match queue.tx.try_send(conn) {
            Ok(()) => debug!(key = %key, idle = queue.len(), "connection pooled"),
            Err(TrySendError::Full(_)) => debug!(key = %key, "pool full, closing connection"),
            Err(TrySendError::Closed(_)) => {}
        }
    }

    async fn queue_for(&self, key: &str) -> Arc<IdleQueue<C>> {
        // Fast path: read lock
        if let Some(queue) = self.inner.queues.read().await.get(key) {
            return Arc::clone(queue);
        }

        // Slow path: write lock
        let mut queues = self.inner.queues.write().await;
        if let Some(queue) = queues.get(key) {
            return Arc::clone(queue);
        }
        let queue = Arc::new(IdleQueue::new(self.inner.config.capacity));
        queues.insert(key.to_string(), Arc::clone(&queue));
        tokio::spawn(sweep(
            Arc::clone(&self.inner),
            key.to_string(),
            Arc::clone(&queue),
        ));
        queue
    }

    /// Close every idle connection. Used when file descriptors run out.
    pub async fn close_all(&self) {
        let queues: Vec<_> = self.inner.queues.write().await.drain().collect();
        let mut closed = 0;
        for (_, queue) in queues {
            closed += queue.drain().await;
        }
        debug!(closed, "closed all pooled connections");
    }

    /// Idle connections queued for `key`.
    pub async fn len(&self, key: &str) -> usize {
        self.inner
            .queues
            .read()
            .await
            .get(key)
            .map_or(0, |q| q.len())
    }

    /// Number of keys with a queue.
    pub async fn key_count(&self) -> usize {
        self.inner.queues.read().await.len()
    }
}

/// Periodically close expired connections for one key.
///
/// The first live connection found is put back and the sweep waits again.
/// Once the queue is empty the key is removed; after a short delay anything
/// put into the orphaned queue meanwhile is closed and the task exits.
async fn sweep<C: Poolable>(inner: Arc<PoolInner<C>>, key: String, queue: Arc<IdleQueue<C>>) {
    loop {
        sleep(inner.config.sweep_interval).await;

        let live = {
            let mut rx = queue.rx.lock().await;
            let mut live = None;
            while let Ok(conn) = rx.try_recv() {
                if !conn.is_expired(Instant::now()) {
                    live = Some(conn);
                    break;
                }
            }
            live
        };

        if let Some(conn) = live {
            let _ = queue.tx.try_send(conn);
            continue;
        }

        {
            let mut queues = inner.queues.write().await;
            if queues.get(&key).is_some_and(|q| Arc::ptr_eq(q, &queue)) {
                queues.remove(&key);
            }
        }
        sleep(inner.config.final_sweep_delay).await;
        let closed = queue.drain().await;
        debug!(key = %key, closed, "pool key swept");
        return;
    }
}
