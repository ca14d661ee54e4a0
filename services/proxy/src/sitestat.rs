//! Site reachability classifier.
//!
//! Tracks, per host and per registrable domain, how often direct
//! connections succeeded and how often they looked blocked, and turns those
//! counters into a routing [`Verdict`].
//!
//! Counters live in relaxed atomics behind a coarse map lock. Concurrent
//! updates may lose an increment; the verdict only needs the trend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate};
use detour_site::{host_to_domain, Destination};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default saturation value for both counters.
pub const DEFAULT_MAX_CNT: u8 = 100;

/// Default margin of direct over blocked visits for a direct verdict.
pub const DEFAULT_DIRECT_DELTA: u8 = 5;

/// Default margin of blocked over direct visits for a blocked verdict.
pub const DEFAULT_BLOCKED_DELTA: u8 = 2;

/// How long a host stays blocked after a blocked signal.
pub const DEFAULT_TEMP_BLOCKED_TTL: Duration = Duration::from_secs(120);

/// Routing verdict for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Connect directly.
    Direct,
    /// Connect through a parent proxy.
    Blocked,
    /// Try direct with short timeouts, fall back to a parent.
    Unknown,
}

/// User override for a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UserMode {
    /// Learn from visits.
    Auto = 0,
    /// Always connect directly.
    Direct = 1,
    /// Always use a parent proxy.
    Blocked = 2,
}

impl UserMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => UserMode::Direct,
            2 => UserMode::Blocked,
            _ => UserMode::Auto,
        }
    }
}

/// Today's date in local time.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

// ============================================================================
// VisitCnt
// ============================================================================

/// Visit counters for one host or domain.
#[derive(Debug)]
pub struct VisitCnt {
    direct: AtomicU8,
    blocked: AtomicU8,
    /// Last visit, as days since the common era.
    recent: AtomicI32,
    pinned: AtomicU8,
    max_cnt: u8,
}

impl VisitCnt {
    /// Create an empty entry.
    pub fn new(max_cnt: u8) -> Self {
        Self::with_counts(0, 0, today(), max_cnt)
    }

    /// Create an entry with restored counters.
    pub fn with_counts(direct: u8, blocked: u8, recent: NaiveDate, max_cnt: u8) -> Self {
        Self {
            direct: AtomicU8::new(direct.min(max_cnt)),
            blocked: AtomicU8::new(blocked.min(max_cnt)),
            recent: AtomicI32::new(recent.num_days_from_ce()),
            pinned: AtomicU8::new(UserMode::Auto as u8),
            max_cnt,
        }
    }

    pub fn direct(&self) -> u8 {
        self.direct.load(Ordering::Relaxed)
    }

    pub fn blocked(&self) -> u8 {
        self.blocked.load(Ordering::Relaxed)
    }

    /// Date of the last recorded visit.
    pub fn recent(&self) -> NaiveDate {
        NaiveDate::from_num_days_from_ce_opt(self.recent.load(Ordering::Relaxed))
            .unwrap_or_else(today)
    }

    pub fn user_mode(&self) -> UserMode {
        UserMode::from_u8(self.pinned.load(Ordering::Relaxed))
    }

    pub fn set_user_mode(&self, mode: UserMode) {
        self.pinned.store(mode as u8, Ordering::Relaxed);
    }

    pub fn is_pinned(&self) -> bool {
        self.user_mode() != UserMode::Auto
    }

    /// Record a successful direct visit. Ignored for pinned entries.
    pub fn visit_direct(&self, on: NaiveDate) {
        if self.is_pinned() {
            return;
        }
        saturating_inc(&self.direct, self.max_cnt);
        self.blocked.store(0, Ordering::Relaxed);
        self.recent.store(on.num_days_from_ce(), Ordering::Relaxed);
    }

    /// Record a blocked visit. Ignored for pinned entries.
    pub fn visit_blocked(&self, on: NaiveDate) {
        if self.is_pinned() {
            return;
        }
        saturating_inc(&self.blocked, self.max_cnt);
        self.direct.store(0, Ordering::Relaxed);
        self.recent.store(on.num_days_from_ce(), Ordering::Relaxed);
    }
}

fn saturating_inc(cell: &AtomicU8, max: u8) {
    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        if v < max {
            Some(v + 1)
        } else {
            None
        }
    });
}

// ============================================================================
// SiteStat
// ============================================================================

/// Classifier settings.
#[derive(Debug, Clone)]
pub struct SiteStatConfig {
    /// Whether any parent proxy is configured. Without one every verdict is
    /// `Direct`.
    pub has_parent: bool,
    pub direct_delta: u8,
    pub blocked_delta: u8,
    pub max_cnt: u8,
    pub temp_blocked_ttl: Duration,
}

impl Default for SiteStatConfig {
    fn default() -> Self {
        Self {
            has_parent: true,
            direct_delta: DEFAULT_DIRECT_DELTA,
            blocked_delta: DEFAULT_BLOCKED_DELTA,
            max_cnt: DEFAULT_MAX_CNT,
            temp_blocked_ttl: DEFAULT_TEMP_BLOCKED_TTL,
        }
    }
}

/// What the session layer needs to know about a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteInfo {
    pub verdict: Verdict,
    pub always_direct: bool,
    pub always_blocked: bool,
    /// The site has been seen blocked before; dial with short timeouts.
    pub once_blocked: bool,
}

/// A persisted view of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteRecord {
    pub direct: u8,
    pub blocked: u8,
    pub recent: NaiveDate,
    pub mode: UserMode,
}

/// The reachability classifier.
pub struct SiteStat {
    config: SiteStatConfig,
    /// Entries keyed by host or domain.
    vcnt: RwLock<HashMap<String, Arc<VisitCnt>>>,
    /// Hosts recently seen blocked, with their expiry.
    temp_blocked: RwLock<HashMap<String, Instant>>,
    /// Domains with at least one blocked host.
    has_blocked_host: RwLock<HashSet<String>>,
}

impl SiteStat {
    pub fn new(config: SiteStatConfig) -> Self {
        Self {
            config,
            vcnt: RwLock::new(HashMap::new()),
            temp_blocked: RwLock::new(HashMap::new()),
            has_blocked_host: RwLock::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &SiteStatConfig {
        &self.config
    }

    /// Decide how to reach a destination.
    pub async fn classify(&self, dest: &Destination) -> Verdict {
        if !self.config.has_parent {
            return Verdict::Direct;
        }
        let Some(domain) = dest.domain() else {
            return Verdict::Direct;
        };
        if self.is_temp_blocked(dest.host()).await {
            return Verdict::Blocked;
        }

        let (host_entry, domain_entry) = {
            let vcnt = self.vcnt.read().await;
            (vcnt.get(dest.host()).cloned(), vcnt.get(domain).cloned())
        };

        for entry in [&host_entry, &domain_entry].into_iter().flatten() {
            match entry.user_mode() {
                UserMode::Direct => return Verdict::Direct,
                UserMode::Blocked => return Verdict::Blocked,
                UserMode::Auto => {}
            }
        }

        match host_entry.or(domain_entry) {
            Some(entry) => self.counts_verdict(&entry),
            None => Verdict::Direct,
        }
    }

    fn counts_verdict(&self, entry: &VisitCnt) -> Verdict {
        let direct = i16::from(entry.direct());
        let blocked = i16::from(entry.blocked());
        if blocked == 0 || direct - blocked >= i16::from(self.config.direct_delta) {
            Verdict::Direct
        } else if blocked - direct >= i16::from(self.config.blocked_delta) {
            Verdict::Blocked
        } else {
            Verdict::Unknown
        }
    }

    /// Verdict plus the flags the session layer uses for timeouts and
    /// fallback.
    pub async fn site_info(&self, dest: &Destination) -> SiteInfo {
        let verdict = self.classify(dest).await;
        let mode = self.user_mode_of(dest).await;
        let once_blocked = match dest.domain() {
            None => false,
            Some(domain) => {
                let seen = {
                    let vcnt = self.vcnt.read().await;
                    [dest.host(), domain]
                        .iter()
                        .filter_map(|k| vcnt.get(*k))
                        .any(|e| e.blocked() > 0)
                };
                seen || self.is_temp_blocked(dest.host()).await
            }
        };
        SiteInfo {
            verdict,
            always_direct: dest.domain().is_none() || mode == UserMode::Direct,
            always_blocked: mode == UserMode::Blocked,
            once_blocked,
        }
    }

    /// The effective user mode: the host's pin, else the domain's.
    async fn user_mode_of(&self, dest: &Destination) -> UserMode {
        let Some(domain) = dest.domain() else {
            return UserMode::Auto;
        };
        let vcnt = self.vcnt.read().await;
        [dest.host(), domain]
            .iter()
            .filter_map(|k| vcnt.get(*k))
            .map(|e| e.user_mode())
            .find(|m| *m != UserMode::Auto)
            .unwrap_or(UserMode::Auto)
    }

    /// The entry visits for this destination are recorded on.
    ///
    /// This is the host entry, created lazily, or the domain entry when the
    /// domain is pinned. Returns `None` for destinations without a domain.
    pub async fn entry(&self, dest: &Destination) -> Option<Arc<VisitCnt>> {
        let domain = dest.domain()?;
        {
            let vcnt = self.vcnt.read().await;
            if let Some(host_entry) = vcnt.get(dest.host()) {
                return Some(Arc::clone(host_entry));
            }
            if let Some(domain_entry) = vcnt.get(domain) {
                if domain_entry.is_pinned() {
                    return Some(Arc::clone(domain_entry));
                }
            }
        }
        let mut vcnt = self.vcnt.write().await;
        let entry = vcnt
            .entry(dest.host().to_string())
            .or_insert_with(|| Arc::new(VisitCnt::new(self.config.max_cnt)));
        Some(Arc::clone(entry))
    }

    /// Record a successful direct connection.
    pub async fn record_direct_success(&self, dest: &Destination) {
        if let Some(entry) = self.entry(dest).await {
            entry.visit_direct(today());
        }
    }

    /// Record that a direct connection looked blocked.
    ///
    /// Takes effect immediately: the host is treated as blocked for a while
    /// and its domain is marked as having a blocked host. Ignored when the
    /// host or its domain is pinned.
    pub async fn record_blocked(&self, dest: &Destination) {
        let Some(domain) = dest.domain() else {
            return;
        };
        if self.user_mode_of(dest).await != UserMode::Auto {
            return;
        }
        let Some(entry) = self.entry(dest).await else {
            return;
        };
        entry.visit_blocked(today());

        self.temp_blocked.write().await.insert(
            dest.host().to_string(),
            Instant::now() + self.config.temp_blocked_ttl,
        );
        self.has_blocked_host
            .write()
            .await
            .insert(domain.to_string());

        info!(host = %dest.host(), blocked = entry.blocked(), "site marked blocked");
    }

    async fn is_temp_blocked(&self, host: &str) -> bool {
        {
            let temp = self.temp_blocked.read().await;
            match temp.get(host) {
                None => return false,
                Some(expiry) if *expiry > Instant::now() => return true,
                Some(_) => {}
            }
        }
        let mut temp = self.temp_blocked.write().await;
        if temp.get(host).is_some_and(|e| *e <= Instant::now()) {
            temp.remove(host);
        }
        false
    }

    /// Whether a destination can be sent direct by PAC-style collaborators:
    /// a direct verdict and no blocked host under its domain.
    pub async fn should_treat_direct(&self, dest: &Destination) -> bool {
        if self.classify(dest).await != Verdict::Direct {
            return false;
        }
        match dest.domain() {
            None => true,
            Some(domain) => !self.has_blocked_host.read().await.contains(domain),
        }
    }

    /// Sites classified direct, minus domains that have a blocked host.
    pub async fn direct_list(&self) -> Vec<String> {
        let has_blocked = self.has_blocked_host.read().await;
        let vcnt = self.vcnt.read().await;
        let mut sites: Vec<String> = vcnt
            .iter()
            .filter(|(_, entry)| match entry.user_mode() {
                UserMode::Direct => true,
                UserMode::Blocked => false,
                UserMode::Auto => {
                    entry.direct() > 0 && self.counts_verdict(entry) == Verdict::Direct
                }
            })
            .filter(|(site, _)| match host_to_domain(site) {
                Some(domain) => !has_blocked.contains(&domain),
                None => false,
            })
            .map(|(site, _)| site.clone())
            .collect();
        sites.sort();
        sites
    }

    /// Force a host or domain to a routing mode.
    pub async fn set_user_mode(&self, site: &str, mode: UserMode) {
        let site = site.trim().trim_end_matches('.').to_ascii_lowercase();
        if site.is_empty() {
            return;
        }
        let mut vcnt = self.vcnt.write().await;
        vcnt.entry(site.clone())
            .or_insert_with(|| Arc::new(VisitCnt::new(self.config.max_cnt)))
            .set_user_mode(mode);
        debug!(site = %site, mode = ?mode, "user mode set");
    }

    /// Pin the sites from the user's always-direct and always-blocked lists.
    pub async fn load_user_lists(&self, direct: &[String], blocked: &[String]) {
        for site in direct {
            self.set_user_mode(site, UserMode::Direct).await;
        }
        for site in blocked {
            self.set_user_mode(site, UserMode::Blocked).await;
        }
    }

    /// Copy every entry out for persistence.
    pub async fn snapshot(&self) -> BTreeMap<String, SiteRecord> {
        self.vcnt
            .read()
            .await
            .iter()
            .map(|(site, entry)| {
                (
                    site.clone(),
                    SiteRecord {
                        direct: entry.direct(),
                        blocked: entry.blocked(),
                        recent: entry.recent(),
                        mode: entry.user_mode(),
                    },
                )
            })
            .collect()
    }

    /// Restore persisted entries, then rebuild the blocked-host table.
    pub async fn restore(&self, records: BTreeMap<String, SiteRecord>) {
        {
            let mut vcnt = self.vcnt.write().await;
            for (site, record) in records {
                let entry =
                    VisitCnt::with_counts(record.direct, record.blocked, record.recent, self.config.max_cnt);
                entry.set_user_mode(record.mode);
                vcnt.insert(site, Arc::new(entry));
            }
        }
        self.rebuild_blocked_hosts().await;
    }

    /// Recompute the domains that have a blocked host.
    pub async fn rebuild_blocked_hosts(&self) {
        let domains: HashSet<String> = {
            let vcnt = self.vcnt.read().await;
            vcnt.iter()
                .filter(|(_, e)| e.user_mode() == UserMode::Blocked || e.blocked() > 0)
                .filter_map(|(site, _)| host_to_domain(site))
                .collect()
        };
        *self.has_blocked_host.write().await = domains;
    }

    /// Number of entries.
    pub async fn len(&self) -> usize {
        self.vcnt.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.vcnt.read().await.is_empty()
    }
}
