//! Network health estimation.
//!
//! Periodically measures how long it takes to reach a well-known site and
//! scales the dial and read timeouts accordingly. When the estimates differ
//! from the configured baseline the local network is considered bad, and
//! parent proxies are not blamed for failures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::stream::Dialer;

/// Default baseline for both timeouts.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for estimated timeouts.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(15);

/// Growth applied after a failed probe.
pub const FAILURE_PENALTY: Duration = Duration::from_secs(2);

/// Dial timeout for sites that were blocked before or are unknown.
pub const SHORT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Read timeout for connections that may be faked.
pub const SHORT_READ_TIMEOUT: Duration = Duration::from_secs(4);

/// Interval between probes.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(60);

const DIAL_FACTOR: u32 = 5;
const READ_FACTOR: u32 = 10;

/// Current dial/read timeouts.
#[derive(Debug)]
pub struct TimeoutEstimator {
    base_dial: Duration,
    base_read: Duration,
    dial_ms: AtomicU64,
    read_ms: AtomicU64,
}

impl Default for TimeoutEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_TIMEOUT)
    }
}

impl TimeoutEstimator {
    pub fn new(base_dial: Duration, base_read: Duration) -> Self {
        Self {
            base_dial,
            base_read,
            dial_ms: AtomicU64::new(as_ms(base_dial)),
            read_ms: AtomicU64::new(as_ms(base_read)),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_ms.load(Ordering::Relaxed))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_ms.load(Ordering::Relaxed))
    }

    pub fn short_dial_timeout(&self) -> Duration {
        SHORT_DIAL_TIMEOUT.min(self.dial_timeout())
    }

    pub fn short_read_timeout(&self) -> Duration {
        SHORT_READ_TIMEOUT.min(self.read_timeout())
    }

    /// Whether either timeout has moved off its baseline.
    pub fn network_bad(&self) -> bool {
        self.dial_timeout() != self.base_dial || self.read_timeout() != self.base_read
    }

    /// Fold in a successful probe.
    pub fn record_success(&self, connect: Duration, fetch: Duration) {
        let dial = scaled(connect, DIAL_FACTOR, self.base_dial);
        let read = scaled(fetch, READ_FACTOR, self.base_read);
        self.dial_ms.store(as_ms(dial), Ordering::Relaxed);
        self.read_ms.store(as_ms(read), Ordering::Relaxed);
        debug!(dial_timeout = ?dial, read_timeout = ?read, "timeouts estimated");
    }

    /// Fold in a failed probe.
    pub fn record_failure(&self) {
        let dial = (self.dial_timeout() + FAILURE_PENALTY).min(MAX_TIMEOUT.max(self.base_dial));
        let read = (self.read_timeout() + FAILURE_PENALTY).min(MAX_TIMEOUT.max(self.base_read));
        self.dial_ms.store(as_ms(dial), Ordering::Relaxed);
        self.read_ms.store(as_ms(read), Ordering::Relaxed);
        warn!(dial_timeout = ?dial, read_timeout = ?read, "network probe failed, timeouts raised");
    }

    /// Probe `target` once: connect to port 80 and fetch `/`.
    pub async fn probe(&self, dialer: &Dialer, target: &str) {
        let start = Instant::now();
        let mut stream = match dialer.connect(target, 80, MAX_TIMEOUT).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(target = %target, error = %e, "probe connect failed");
                self.record_failure();
                return;
            }
        };
        let connect = start.elapsed();

        let fetch_start = Instant::now();
        let request = format!("GET / HTTP/1.1\r\nHost: {target}\r\nConnection: close\r\n\r\n");
        let fetch = async {
            stream.write_all(request.as_bytes()).await?;
            let mut sink = Vec::new();
            stream.read_to_end(&mut sink).await
        };
        match timeout(MAX_TIMEOUT, fetch).await {
            Ok(Ok(_)) => self.record_success(connect, fetch_start.elapsed()),
            Ok(Err(e)) => {
                debug!(target = %target, error = %e, "probe fetch failed");
                self.record_failure();
            }
            Err(_) => self.record_failure(),
        }
    }

    /// Probe every minute until shutdown.
    pub async fn run(self: Arc<Self>, dialer: Dialer, target: String, mut shutdown: watch::Receiver<bool>) {
        info!(target = %target, "network estimator started");
        loop {
            self.probe(&dialer, &target).await;
            tokio::select! {
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }
        }
    }
}

fn scaled(measured: Duration, factor: u32, base: Duration) -> Duration {
    (measured * factor).min(MAX_TIMEOUT).max(base)
}

fn as_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
