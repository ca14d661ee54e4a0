//! Classifier state persistence.
//!
//! The state file is JSON:
//!
//! ```text
//! {"update": "2024-05-01", "site_info": {"www.example.com": {"direct": 3, "block": 0, "recent": "2024-04-30"}}}
//! ```
//!
//! Saves go through a temp file and a rename. Pinned sites are never saved
//! because the user lists are reloaded on startup. Entries idle for longer
//! than the stale threshold are dropped, unless the file itself is that old
//! (the proxy was not running), in which case nothing is dropped and the
//! update date only advances by a fifth of the threshold.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use detour_site::host_to_domain;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::sitestat::{today, SiteRecord, SiteStat, UserMode};

/// Entries not visited for this many days are dropped.
pub const STALE_DAYS: i64 = 30;

/// Interval between background saves.
pub const SAVE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// One persisted site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSite {
    pub direct: u8,
    pub block: u8,
    pub recent: NaiveDate,
}

/// The persisted classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedStat {
    pub update: NaiveDate,
    #[serde(default)]
    pub site_info: BTreeMap<String, PersistedSite>,
}

impl PersistedStat {
    fn empty(update: NaiveDate) -> Self {
        Self {
            update,
            site_info: BTreeMap::new(),
        }
    }

    /// Build what to save from a classifier snapshot.
    pub fn from_snapshot(
        records: &BTreeMap<String, SiteRecord>,
        last_update: NaiveDate,
        today: NaiveDate,
    ) -> Self {
        let threshold = chrono::Duration::days(STALE_DAYS);
        let pinned = |site: &str| {
            records
                .get(site)
                .is_some_and(|r| r.mode != UserMode::Auto)
        };
        let keep_all = today - last_update > threshold;
        let update = if keep_all {
            (last_update + threshold / 5).min(today)
        } else {
            today
        };

        let site_info = records
            .iter()
            .filter(|(site, record)| {
                if record.mode != UserMode::Auto {
                    return false;
                }
                if host_to_domain(site).is_some_and(|d| pinned(&d)) {
                    return false;
                }
                keep_all || today - record.recent <= threshold
            })
            .map(|(site, record)| {
                (
                    site.clone(),
                    PersistedSite {
                        direct: record.direct,
                        block: record.blocked,
                        recent: record.recent,
                    },
                )
            })
            .collect();

        Self { update, site_info }
    }

    /// Records to hand to [`SiteStat::restore`].
    pub fn into_records(self) -> BTreeMap<String, SiteRecord> {
        self.site_info
            .into_iter()
            .map(|(site, s)| {
                (
                    site,
                    SiteRecord {
                        direct: s.direct,
                        blocked: s.block,
                        recent: s.recent,
                        mode: UserMode::Auto,
                    },
                )
            })
            .collect()
    }
}

/// The classifier state file.
pub struct StatFile {
    path: PathBuf,
    /// Update date of the last load or save, as days since the common era.
    update: AtomicI32,
}

impl StatFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            update: AtomicI32::new(today().num_days_from_ce()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn last_update(&self) -> NaiveDate {
        NaiveDate::from_num_days_from_ce_opt(self.update.load(Ordering::Relaxed)).unwrap_or_else(today)
    }

    /// Load the file. A missing file is an empty state.
    pub fn load(&self) -> Result<PersistedStat> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no stat file, starting fresh");
            return Ok(PersistedStat::empty(today()));
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read stat file: {}", self.path.display()))?;
        let stat: PersistedStat = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse stat file: {}", self.path.display()))?;
        self.update
            .store(stat.update.num_days_from_ce(), Ordering::Relaxed);

        info!(
            path = %self.path.display(),
            update = %stat.update,
            site_count = stat.site_info.len(),
            "loaded site stat"
        );
        Ok(stat)
    }

    /// Save atomically.
    pub fn save(&self, stat: &PersistedStat) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        let content = serde_json::to_string_pretty(stat).context("Failed to serialize site stat")?;
        fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        self.update
            .store(stat.update.num_days_from_ce(), Ordering::Relaxed);

        debug!(
            path = %self.path.display(),
            site_count = stat.site_info.len(),
            "saved site stat"
        );
        Ok(())
    }

    /// Snapshot the classifier and save it.
    pub async fn store(&self, sitestat: &SiteStat) -> Result<()> {
        let records = sitestat.snapshot().await;
        let stat = PersistedStat::from_snapshot(&records, self.last_update(), today());
        self.save(&stat)
    }
}

/// Read a domain list: one site per line, `#` starts a comment. A missing
/// file is an empty list.
pub fn load_domain_list(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        debug!(path = %path.display(), "no domain list");
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read domain list: {}", path.display()))?;
    Ok(content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.trim_end_matches('.').to_ascii_lowercase())
        .collect())
}

/// Fill the classifier: saved counters first, then the user lists pinned on
/// top, then the blocked-host table.
pub async fn load_site_stat(
    sitestat: &SiteStat,
    stat_file: Option<&StatFile>,
    always_direct: Option<&Path>,
    always_blocked: Option<&Path>,
) -> Result<()> {
    if let Some(file) = stat_file {
        sitestat.restore(file.load()?.into_records()).await;
    }
    let direct = always_direct.map(load_domain_list).transpose()?.unwrap_or_default();
    let blocked = always_blocked.map(load_domain_list).transpose()?.unwrap_or_default();
    if !direct.is_empty() || !blocked.is_empty() {
        info!(direct = direct.len(), blocked = blocked.len(), "loaded user domain lists");
    }
    sitestat.load_user_lists(&direct, &blocked).await;
    sitestat.rebuild_blocked_hosts().await;
    Ok(())
}

/// Save every `interval` until shutdown.
pub async fn run_saver(
    stat_file: Arc<StatFile>,
    sitestat: Arc<SiteStat>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
        if let Err(e) = stat_file.store(&sitestat).await {
            error!(error = %e, "saving site stat failed");
        }
    }
}

/// Final save on shutdown; failures are only logged.
pub async fn save_on_exit(stat_file: &StatFile, sitestat: &SiteStat) {
    match stat_file.store(sitestat).await {
        Ok(()) => info!(path = %stat_file.path().display(), "site stat saved"),
        Err(e) => warn!(error = %e, "final site stat save failed"),
    }
}
