//! Upstream connections and their lifecycle.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use detour_site::Destination;
use tokio::io::BufReader;
use tokio::time::Instant;
use tracing::debug;

use crate::estimate::TimeoutEstimator;
use crate::pool::Poolable;
use crate::sitestat::{today, VisitCnt};
use crate::stream::BoxedStream;

/// Pool key shared by HTTP relay connections to parents, which serve any
/// destination.
pub const RELAY_POOL_KEY: &str = "relay:";

/// How an upstream connection was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnKind {
    Direct,
    /// Tunnel through the named parent proxy.
    Parent(String),
    /// HTTP proxy connection to the named parent; requests go in absolute
    /// form with the given `Proxy-Authorization` credentials.
    Relay { parent: String, auth: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connected = 0,
    /// At least one response byte came back.
    ResponseReceived = 1,
    Stopped = 2,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Connected,
            1 => ConnState::ResponseReceived,
            _ => ConnState::Stopped,
        }
    }
}

/// Everything about a connection except the stream itself, so tunnel
/// loops can read it while the stream is split.
#[derive(Debug)]
pub struct ConnMeta {
    key: String,
    dest: Destination,
    kind: ConnKind,
    state: AtomicU8,
    expire: Instant,
    site: Option<Arc<VisitCnt>>,
    always_direct: bool,
    /// The site is unknown or was blocked before; give up on a silent
    /// first response sooner.
    short_read: bool,
}

impl ConnMeta {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dest(&self) -> &Destination {
        &self.dest
    }

    pub fn kind(&self) -> &ConnKind {
        &self.kind
    }

    pub fn is_direct(&self) -> bool {
        self.kind == ConnKind::Direct
    }

    /// How long to wait for the first byte while the connection may be fake.
    pub fn first_read_timeout(&self, estimator: &TimeoutEstimator) -> Duration {
        if self.short_read {
            estimator.short_read_timeout()
        } else {
            estimator.read_timeout()
        }
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// A direct connection that has not produced a byte yet may lead to a
    /// forged endpoint (poisoned DNS, injected resets).
    pub fn maybe_fake(&self) -> bool {
        self.state() == ConnState::Connected && self.is_direct() && !self.always_direct
    }

    /// Mark the first response byte. A direct connection counts as one
    /// direct visit for its site, once.
    pub fn set_response_received(&self) {
        let first = self
            .state
            .compare_exchange(
                ConnState::Connected as u8,
                ConnState::ResponseReceived as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if first && self.is_direct() {
            if let Some(site) = &self.site {
                site.visit_direct(today());
                debug!(host = %self.dest.host(), direct = site.direct(), "direct visit recorded");
            }
        }
    }

    pub fn stop(&self) {
        self.state.store(ConnState::Stopped as u8, Ordering::Release);
    }
}

/// A connection to a destination, direct or through a parent.
pub struct ServerConn {
    pub(crate) io: BufReader<BoxedStream>,
    pub(crate) meta: ConnMeta,
}

impl ServerConn {
    pub fn new(
        stream: BoxedStream,
        dest: &Destination,
        kind: ConnKind,
        site: Option<Arc<VisitCnt>>,
        always_direct: bool,
        keep_alive: Duration,
    ) -> Self {
        let key = match &kind {
            ConnKind::Relay { .. } => RELAY_POOL_KEY.to_string(),
            _ => dest.host_port(),
        };
        Self {
            io: BufReader::new(stream),
            meta: ConnMeta {
                key,
                dest: dest.clone(),
                kind,
                state: AtomicU8::new(ConnState::Connected as u8),
                expire: Instant::now() + keep_alive,
                site,
                always_direct,
                short_read: false,
            },
        }
    }

    /// Use the short first-read timeout.
    pub fn with_short_read(mut self) -> Self {
        self.meta.short_read = true;
        self
    }

    pub fn meta(&self) -> &ConnMeta {
        &self.meta
    }

    pub fn maybe_fake(&self) -> bool {
        self.meta.maybe_fake()
    }

    /// Restart the idle clock after a completed exchange.
    pub fn touch(&mut self, keep_alive: Duration) {
        self.meta.expire = Instant::now() + keep_alive;
    }
}

impl std::fmt::Debug for ServerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConn").field("meta", &self.meta).finish()
    }
}

impl Poolable for ServerConn {
    fn pool_key(&self) -> &str {
        &self.meta.key
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.meta.state() == ConnState::Stopped || now >= self.meta.expire
    }
}
