//! Shared state handed to every client session.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::estimate::TimeoutEstimator;
use crate::parent::ParentPool;
use crate::pool::ConnPool;
use crate::session::ServerConn;
use crate::sitestat::SiteStat;
use crate::stream::Dialer;

/// Attempts per request before giving up.
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// Largest request body (or tunnel prefix) retained for replay.
pub const DEFAULT_REPLAY_LIMIT: usize = 256 * 1024;

/// Idle lifetime of an upstream connection without `Keep-Alive: timeout`.
pub const DEFAULT_SERVER_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Client read poll while a tunnel's upstream is unconfirmed.
pub const DEFAULT_TUNNEL_POLL: Duration = Duration::from_secs(3);

/// Ports CONNECT may reach: HTTPS, SSH, IMAPS, POP3S, XMPP and common
/// alternates.
pub const DEFAULT_TUNNEL_PORTS: &[u16] = &[22, 80, 443, 563, 993, 995, 5222, 5223, 8080, 8443];

/// Per-request session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_tries: u32,
    pub replay_limit: usize,
    pub server_keep_alive: Duration,
    pub tunnel_poll: Duration,
    pub tunnel_ports: HashSet<u16>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            replay_limit: DEFAULT_REPLAY_LIMIT,
            server_keep_alive: DEFAULT_SERVER_KEEP_ALIVE,
            tunnel_poll: DEFAULT_TUNNEL_POLL,
            tunnel_ports: DEFAULT_TUNNEL_PORTS.iter().copied().collect(),
        }
    }
}

/// Everything a session needs, constructed once at startup.
pub struct ProxyContext {
    pub sitestat: Arc<SiteStat>,
    pub pool: ConnPool<ServerConn>,
    pub parents: Arc<ParentPool>,
    pub estimator: Arc<TimeoutEstimator>,
    pub dialer: Dialer,
    pub session: SessionConfig,
    seq: AtomicU64,
}

impl ProxyContext {
    pub fn new(
        sitestat: Arc<SiteStat>,
        pool: ConnPool<ServerConn>,
        parents: Arc<ParentPool>,
        estimator: Arc<TimeoutEstimator>,
        dialer: Dialer,
        session: SessionConfig,
    ) -> Self {
        Self {
            sitestat,
            pool,
            parents,
            estimator,
            dialer,
            session,
            seq: AtomicU64::new(0),
        }
    }

    /// Sequence number for the next request.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn has_parent(&self) -> bool {
        !self.parents.is_empty()
    }

    pub fn tunnel_allowed(&self, port: u16) -> bool {
        self.session.tunnel_ports.contains(&port)
    }
}
