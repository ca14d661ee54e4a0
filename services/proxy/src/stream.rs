//! Upstream stream abstraction and the direct dialer.
//!
//! Every backend (direct TCP, HTTP CONNECT, SOCKS5, encrypted relay) hands
//! back a [`BoxedStream`]; the session layer never knows which one it got.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use detour_site::Destination;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProxyError;

/// A bidirectional byte stream usable as an upstream connection.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased upstream stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens TCP connections, honoring static host overrides.
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    hosts: HashMap<String, IpAddr>,
}

impl Dialer {
    /// Create a dialer with static `name -> ip` overrides.
    pub fn new(hosts: HashMap<String, IpAddr>) -> Self {
        Self { hosts }
    }

    /// Resolve and connect to a host and port within `dial_timeout`.
    ///
    /// Resolution failures are reported as [`ProxyError::Resolve`] so the
    /// session layer can treat them as a possible block.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        dial_timeout: Duration,
    ) -> Result<TcpStream, ProxyError> {
        match timeout(dial_timeout, self.connect_inner(host, port)).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::timeout("dial", dial_timeout)),
        }
    }

    /// Connect to a destination.
    pub async fn connect_dest(
        &self,
        dest: &Destination,
        dial_timeout: Duration,
    ) -> Result<TcpStream, ProxyError> {
        self.connect(dest.host(), dest.port(), dial_timeout).await
    }

    async fn connect_inner(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let addrs = self.resolve(host, port).await?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(host = %host, addr = %addr, "dialed");
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => ProxyError::Resolve {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            },
        })
    }

    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, ProxyError> {
        if let Some(ip) = self.hosts.get(host) {
            return Ok(vec![SocketAddr::new(*ip, port)]);
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        tokio::net::lookup_host((host, port))
            .await
            .map(|addrs| addrs.collect())
            .map_err(|source| ProxyError::Resolve {
                host: host.to_string(),
                source,
            })
    }
}
