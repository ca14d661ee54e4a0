//! Proxy configuration (env-driven).

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::context::DEFAULT_TUNNEL_PORTS;
use crate::estimate::DEFAULT_TIMEOUT;
use crate::listener::DEFAULT_MAX_CONNECTIONS;
use crate::parent::{CipherSpec, LoadBalance, Method, ParentProxy};
use crate::sitestat::{DEFAULT_BLOCKED_DELTA, DEFAULT_DIRECT_DELTA};

/// Default plain listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7777";

/// An encrypted listener: address plus cipher.
#[derive(Debug, Clone)]
pub struct EncryptedListen {
    pub addr: SocketAddr,
    pub cipher: CipherSpec,
}

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Plain HTTP proxy listen addresses.
    pub listen: Vec<SocketAddr>,

    /// Encrypted listen addresses.
    pub listen_encrypted: Vec<EncryptedListen>,

    pub parents: Vec<ParentProxy>,

    pub load_balance: LoadBalance,

    /// Baseline dial timeout.
    pub dial_timeout: Duration,

    /// Baseline read timeout.
    pub read_timeout: Duration,

    /// Host probed by the network estimator; `None` disables probing.
    pub estimate_target: Option<String>,

    /// Classifier state file.
    pub stat_file: Option<PathBuf>,

    pub always_direct_file: Option<PathBuf>,

    pub always_blocked_file: Option<PathBuf>,

    /// Ports CONNECT may reach.
    pub tunnel_ports: HashSet<u16>,

    pub direct_delta: u8,

    pub blocked_delta: u8,

    /// Per-listener connection limit.
    pub max_connections: usize,

    /// Static host overrides for the direct dialer.
    pub hosts: HashMap<String, IpAddr>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen = list(&var("DETOUR_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string()))
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("DETOUR_LISTEN: invalid address {addr:?}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let listen_encrypted = var("DETOUR_LISTEN_ENCRYPTED")
            .map(|v| {
                list(&v)
                    .map(parse_encrypted_listen)
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()
            .context("DETOUR_LISTEN_ENCRYPTED must be comma-separated method:password@addr entries.")?
            .unwrap_or_default();

        let parents = var("DETOUR_PARENTS")
            .map(|v| {
                list(&v)
                    .map(|uri| uri.parse::<ParentProxy>().map_err(anyhow::Error::from))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()
            .context("DETOUR_PARENTS must be comma-separated parent proxy URIs.")?
            .unwrap_or_default();

        let load_balance = var("DETOUR_LOAD_BALANCE")
            .map(|v| v.parse::<LoadBalance>())
            .transpose()
            .context("DETOUR_LOAD_BALANCE must be backup, round-robin or hash.")?
            .unwrap_or_default();

        let dial_timeout = millis(&var, "DETOUR_DIAL_TIMEOUT_MS")?.unwrap_or(DEFAULT_TIMEOUT);
        let read_timeout = millis(&var, "DETOUR_READ_TIMEOUT_MS")?.unwrap_or(DEFAULT_TIMEOUT);

        let estimate_target = var("DETOUR_ESTIMATE_TARGET").filter(|v| !v.trim().is_empty());

        let stat_file = var("DETOUR_STAT_FILE").map(PathBuf::from);
        let always_direct_file = var("DETOUR_ALWAYS_DIRECT_FILE").map(PathBuf::from);
        let always_blocked_file = var("DETOUR_ALWAYS_BLOCKED_FILE").map(PathBuf::from);

        let tunnel_ports = var("DETOUR_TUNNEL_PORTS")
            .map(|v| list(&v).map(str::parse::<u16>).collect::<Result<HashSet<_>, _>>())
            .transpose()
            .context("DETOUR_TUNNEL_PORTS must be comma-separated port numbers.")?
            .unwrap_or_else(|| DEFAULT_TUNNEL_PORTS.iter().copied().collect());

        let direct_delta: u8 = parsed(&var, "DETOUR_DIRECT_DELTA")?.unwrap_or(DEFAULT_DIRECT_DELTA);
        let blocked_delta: u8 = parsed(&var, "DETOUR_BLOCKED_DELTA")?.unwrap_or(DEFAULT_BLOCKED_DELTA);
        if direct_delta == 0 || blocked_delta == 0 {
            bail!("DETOUR_DIRECT_DELTA and DETOUR_BLOCKED_DELTA must be at least 1.");
        }

        let max_connections: usize =
            parsed(&var, "DETOUR_MAX_CONNECTIONS")?.unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let hosts = var("DETOUR_HOSTS")
            .map(|v| list(&v).map(parse_host_override).collect::<Result<HashMap<_, _>>>())
            .transpose()
            .context("DETOUR_HOSTS must be comma-separated name=ip entries.")?
            .unwrap_or_default();

        let log_level = var("DETOUR_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen,
            listen_encrypted,
            parents,
            load_balance,
            dial_timeout,
            read_timeout,
            estimate_target,
            stat_file,
            always_direct_file,
            always_blocked_file,
            tunnel_ports,
            direct_delta,
            blocked_delta,
            max_connections: max_connections.max(1),
            hosts,
            log_level,
        })
    }
}

fn list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parsed<T, F>(var: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be an integer."))
}

fn millis<F>(var: &F, name: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let ms: Option<u64> = parsed(var, name)?;
    match ms {
        Some(0) => bail!("{name} must be positive (milliseconds)."),
        other => Ok(other.map(Duration::from_millis)),
    }
}

/// `method:password@host:port`. The password may contain `@`.
fn parse_encrypted_listen(entry: &str) -> Result<EncryptedListen> {
    let (secret, addr) = entry
        .rsplit_once('@')
        .with_context(|| format!("missing '@' in {entry:?}"))?;
    let (method, password) = secret
        .split_once(':')
        .with_context(|| format!("missing method in {entry:?}"))?;
    let method: Method = method.parse()?;
    if password.is_empty() {
        bail!("empty password in {entry:?}");
    }
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid address {addr:?}"))?;
    Ok(EncryptedListen {
        addr,
        cipher: CipherSpec::new(method, password),
    })
}

fn parse_host_override(entry: &str) -> Result<(String, IpAddr)> {
    let (name, ip) = entry
        .split_once('=')
        .with_context(|| format!("expected name=ip, got {entry:?}"))?;
    let ip: IpAddr = ip
        .trim()
        .parse()
        .with_context(|| format!("invalid ip in {entry:?}"))?;
    Ok((name.trim().trim_end_matches('.').to_ascii_lowercase(), ip))
}
