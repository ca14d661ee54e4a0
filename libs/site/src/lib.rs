//! Destination identity for the proxy.
//!
//! This library provides helpers for:
//! - Parsing and normalizing `host:port` authorities
//! - Deriving the registrable domain used for site-level policy
//! - Classifying IP literals (private, loopback, public)

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// Destination parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SiteError {
    /// Empty host.
    #[error("empty host")]
    EmptyHost,

    /// Port is not a number in 1..=65535.
    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// Host contains characters not allowed in a hostname.
    #[error("invalid host: {0}")]
    InvalidHost(String),

    /// IPv6 literal with unbalanced brackets.
    #[error("malformed IPv6 literal: {0}")]
    MalformedIpv6(String),
}

// ============================================================================
// Destination
// ============================================================================

/// A normalized `(host, port)` pair with its derived registrable domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    host: String,
    port: u16,
    domain: Option<String>,
}

impl Destination {
    /// Create a destination from a host and port.
    ///
    /// The host is lowercased, a trailing dot is trimmed and IPv6 brackets
    /// are removed.
    pub fn new(host: &str, port: u16) -> Result<Self, SiteError> {
        if port == 0 {
            return Err(SiteError::InvalidPort("0".to_string()));
        }
        let host = normalize_host(host)?;
        let domain = host_to_domain(&host);
        Ok(Self { host, port, domain })
    }

    /// Parse an authority (`host`, `host:port`, `[v6]`, `[v6]:port`).
    ///
    /// `default_port` is used when the authority carries no port.
    pub fn parse_authority(authority: &str, default_port: u16) -> Result<Self, SiteError> {
        let (host, port) = split_host_port(authority)?;
        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| SiteError::InvalidPort(p.to_string()))?,
            None => default_port,
        };
        Self::new(host, port)
    }

    /// Normalized host (no brackets, no trailing dot, lowercase).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registrable domain, `None` for hosts that are always reached directly.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Key used for pooling and logging (`host:port`, IPv6 bracketed).
    pub fn host_port(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Whether the host is an IP literal.
    pub fn is_ip(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// The host as an IP address, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host_port())
    }
}

/// Split an authority into host and optional port text.
///
/// Bare IPv6 literals without brackets are returned whole with no port.
pub fn split_host_port(authority: &str) -> Result<(&str, Option<&str>), SiteError> {
    if let Some(rest) = authority.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err(SiteError::MalformedIpv6(authority.to_string()));
        };
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(port))),
            None if tail.is_empty() => Ok((host, None)),
            None => Err(SiteError::MalformedIpv6(authority.to_string())),
        };
    }

    match authority.rfind(':') {
        // More than one colon without brackets: a bare IPv6 literal.
        Some(idx) if authority[..idx].contains(':') => Ok((authority, None)),
        Some(idx) => Ok((&authority[..idx], Some(&authority[idx + 1..]))),
        None => Ok((authority, None)),
    }
}

fn normalize_host(host: &str) -> Result<String, SiteError> {
    let host = host
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.');
    if host.is_empty() {
        return Err(SiteError::EmptyHost);
    }
    if host.parse::<Ipv6Addr>().is_ok() {
        return Ok(host.to_ascii_lowercase());
    }
    let valid = host
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'_');
    if !valid {
        return Err(SiteError::InvalidHost(host.to_string()));
    }
    Ok(host.to_ascii_lowercase())
}

// ============================================================================
// Registrable domains
// ============================================================================

/// Second-level labels that act as public suffixes under a country code
/// (`bbc.co.uk`, `example.com.cn`).
const MULTI_PART_SUFFIX_LABELS: &[&str] = &["co", "com", "net", "org", "edu", "gov", "ac"];

/// Derive the registrable domain of a normalized host.
///
/// Returns `None` for private, loopback and link-local IPs and for dotless
/// host names; those are always reached directly. Public IP literals are
/// their own domain.
pub fn host_to_domain(host: &str) -> Option<String> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return if is_private_ip(ip) {
            None
        } else {
            Some(host.to_string())
        };
    }

    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    match labels.len() {
        0 | 1 => None,
        2 => Some(labels.join(".")),
        n => {
            let second = labels[n - 2];
            // Only treat `co.uk`-style pairs as a suffix when the last label
            // is a two-letter country code.
            let take = if labels[n - 1].len() == 2 && MULTI_PART_SUFFIX_LABELS.contains(&second)
            {
                3
            } else {
                2
            };
            Some(labels[n - take..].join("."))
        }
    }
}

// ============================================================================
// IP classification
// ============================================================================

/// Whether an IP address is private, loopback, link-local or unspecified.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ipv4(v4);
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (first & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (first & 0xffc0) == 0xfe80
        }
    }
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        // 100.64.0.0/10 carrier-grade NAT
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
}
