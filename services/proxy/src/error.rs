//! Error taxonomy shared by the proxy core.
//!
//! Errors fall into four groups:
//! - retryable transport errors (reset, EOF, timeout)
//! - protocol violations (bad SOCKS/encrypted handshake, bad chunked body)
//! - capacity errors (file descriptors exhausted)
//! - configuration errors (fatal at startup)

use std::io;
use std::time::Duration;

use detour_site::SiteError;
use thiserror::Error;

/// Errors produced while connecting to or talking with upstreams.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Transport error on an established or connecting socket.
    #[error("i/o error: {0}")]
    Io(io::Error),

    /// An operation exceeded its deadline.
    #[error("{what} timed out after {after:?}")]
    Timeout { what: &'static str, after: Duration },

    /// Host name resolution failed.
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// The peer violated the wire protocol (handshake, framing, auth tag).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A parent proxy answered the handshake but refused the destination.
    #[error("parent proxy {parent} refused: {reason}")]
    ParentRefused { parent: String, reason: String },

    /// Too many open file descriptors.
    #[error("too many open connections: {0}")]
    Capacity(#[source] io::Error),

    /// Routing wanted a parent proxy but none is configured.
    #[error("no parent proxy configured")]
    NoParent,

    /// Every parent proxy candidate failed.
    #[error("all parent proxies failed, last error: {0}")]
    ParentsExhausted(#[source] Box<ProxyError>),

    /// Invalid destination in a request.
    #[error("invalid destination: {0}")]
    Destination(#[from] SiteError),

    /// Invalid configuration (parent URI, cipher method).
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        if is_capacity_io(&err) {
            ProxyError::Capacity(err)
        } else if err.kind() == io::ErrorKind::InvalidData {
            ProxyError::Protocol(err.to_string())
        } else {
            ProxyError::Io(err)
        }
    }
}

impl ProxyError {
    /// Build a timeout error.
    pub fn timeout(what: &'static str, after: Duration) -> Self {
        ProxyError::Timeout { what, after }
    }

    /// Transport failures that may succeed when the request is replayed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProxyError::Io(e) => is_retryable_io(e),
            ProxyError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Failures that look like interference rather than a dead server:
    /// timeouts, resets and resolution failures.
    pub fn maybe_blocked(&self) -> bool {
        match self {
            ProxyError::Timeout { .. } | ProxyError::Resolve { .. } => true,
            ProxyError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Whether the error means the process ran out of descriptors.
    pub fn is_capacity(&self) -> bool {
        match self {
            ProxyError::Capacity(_) => true,
            ProxyError::ParentsExhausted(inner) => inner.is_capacity(),
            _ => false,
        }
    }

    /// Whether the error is a reset by peer.
    pub fn is_reset(&self) -> bool {
        matches!(self, ProxyError::Io(e) if e.kind() == io::ErrorKind::ConnectionReset)
    }
}

/// Transport error kinds worth a retry.
pub fn is_retryable_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
    )
}

/// EMFILE / ENFILE.
pub fn is_capacity_io(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::EMFILE || code == libc::ENFILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let reset: ProxyError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(reset.is_retryable());
        assert!(reset.maybe_blocked());
        assert!(reset.is_reset());

        let eof: ProxyError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(eof.is_retryable());
        assert!(!eof.maybe_blocked());

        let refused: ProxyError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert!(!refused.is_retryable());
        assert!(!refused.maybe_blocked());
    }

    #[test]
    fn test_invalid_data_is_protocol_violation() {
        let err: ProxyError = io::Error::new(io::ErrorKind::InvalidData, "bad tag").into();
        assert!(matches!(err, ProxyError::Protocol(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_capacity_detection() {
        let err: ProxyError = io::Error::from_raw_os_error(libc::EMFILE).into();
        assert!(err.is_capacity());

        let wrapped = ProxyError::ParentsExhausted(Box::new(err));
        assert!(wrapped.is_capacity());
    }

    #[test]
    fn test_timeout_is_retryable_and_blocked() {
        let err = ProxyError::timeout("read", Duration::from_secs(3));
        assert!(err.is_retryable());
        assert!(err.maybe_blocked());
        assert_eq!(err.to_string(), "read timed out after 3s");
    }
}
