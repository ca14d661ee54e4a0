//! detour: a forwarding HTTP proxy that learns which sites need a parent
//! proxy.
//!
//! Requests go direct while that works. When a direct connection looks
//! interfered with (timeouts, resets, a server that never answers) the site
//! is marked blocked and the request is replayed through a parent proxy
//! (HTTP CONNECT, SOCKS5 or an encrypted AEAD relay).

pub mod config;
pub mod context;
pub mod error;
pub mod estimate;
pub mod http;
pub mod listener;
pub mod parent;
pub mod persistence;
pub mod pool;
pub mod session;
pub mod sitestat;
pub mod stream;

pub use context::{ProxyContext, SessionConfig};
pub use error::ProxyError;
pub use estimate::TimeoutEstimator;
pub use listener::{Listener, ListenerConfig, ListenerKind, ListenerStats};
pub use parent::{LoadBalance, ParentPool, ParentProxy};
pub use pool::{ConnPool, PoolConfig};
pub use session::ServerConn;
pub use sitestat::{SiteStat, SiteStatConfig, UserMode, Verdict};
pub use stream::Dialer;
