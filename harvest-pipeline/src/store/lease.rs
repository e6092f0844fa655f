//! Promotion lease
//!
//! A lock file next to the Artifact Store. Whoever holds it may train,
//! validate and swap; everyone else gets `LeaseContention`. The file records
//! its holder and acquisition time so a crashed holder's lease goes stale
//! instead of wedging the pipeline forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Content of the lease file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub holder_id: Uuid,
    pub pid: u32,
    pub purpose: String,
    pub acquired_at: DateTime<Utc>,
}

/// Held lease; the file is removed on drop if this holder still owns it
#[derive(Debug)]
pub struct LeaseGuard {
    path: PathBuf,
    info: LeaseInfo,
}

impl LeaseGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &LeaseInfo {
        &self.info
    }

    /// Whether the lease file still names this holder
    ///
    /// False once another process has broken the lease as stale.
    pub fn is_held(&self) -> bool {
        read_lease(&self.path).is_some_and(|info| info.holder_id == self.info.holder_id)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        // A stale-lease breaker may have replaced the file; leave theirs alone
        match read_lease(&self.path) {
            Some(info) if info.holder_id == self.info.holder_id => {
                if let Err(e) = fs::remove_file(&self.path) {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to release lease");
                } else {
                    tracing::debug!(holder_id = %self.info.holder_id, "Lease released");
                }
            }
            _ => tracing::warn!(
                holder_id = %self.info.holder_id,
                "Lease no longer owned at release"
            ),
        }
    }
}

/// Lease on one Artifact Store
#[derive(Debug, Clone)]
pub struct PromotionLease {
    path: PathBuf,
    stale_after: Duration,
    wait: Duration,
}

impl PromotionLease {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration, wait: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
            wait,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current holder, if any
    pub fn holder(&self) -> Option<LeaseInfo> {
        read_lease(&self.path)
    }

    /// Acquire the lease, waiting with exponential backoff up to the configured bound
    pub async fn acquire(&self, purpose: &str) -> PipelineResult<LeaseGuard> {
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if let Some(guard) = self.try_acquire(purpose)? {
                return Ok(guard);
            }

            let elapsed = started.elapsed();
            if elapsed >= self.wait {
                let holder = self
                    .holder()
                    .map(|h| format!("held by {} ({}) since {}", h.holder_id, h.purpose, h.acquired_at))
                    .unwrap_or_else(|| "held by another process".to_string());
                return Err(PipelineError::LeaseContention(holder));
            }

            let sleep = backoff.min(self.wait - elapsed);
            tracing::debug!(wait_ms = sleep.as_millis() as u64, "Lease busy, backing off");
            tokio::time::sleep(sleep).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Single non-blocking attempt; breaks a stale lease at most once
    pub fn try_acquire(&self, purpose: &str) -> PipelineResult<Option<LeaseGuard>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let info = LeaseInfo {
            holder_id: Uuid::new_v4(),
            pid: std::process::id(),
            purpose: purpose.to_string(),
            acquired_at: Utc::now(),
        };

        for _ in 0..2 {
            if self.create_lease_file(&info)? {
                tracing::debug!(holder_id = %info.holder_id, purpose = %purpose, "Lease acquired");
                return Ok(Some(LeaseGuard {
                    path: self.path.clone(),
                    info,
                }));
            }

            if !self.break_if_stale() {
                return Ok(None);
            }
        }

        Ok(None)
    }

    /// Publish the lease file with its content in one step
    ///
    /// Written to a private temp file first and hard-linked into place, so
    /// the lease never exists half-written and creation fails if it exists.
    fn create_lease_file(&self, info: &LeaseInfo) -> PipelineResult<bool> {
        let tmp = self
            .path
            .with_file_name(format!(".lease-{}.tmp", info.holder_id));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(info)?)?;
            file.sync_all()?;
        }

        let linked = fs::hard_link(&tmp, &self.path);
        let _ = fs::remove_file(&tmp);

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the existing lease if it is stale or unreadable
    fn break_if_stale(&self) -> bool {
        let (stale_holder, reason) = match read_lease(&self.path) {
            None if !self.path.exists() => return true,
            None => (None, "unreadable lease file".to_string()),
            Some(info) => {
                let age = Utc::now()
                    .signed_duration_since(info.acquired_at)
                    .to_std()
                    .unwrap_or_default();
                if age <= self.stale_after {
                    return false;
                }
                let reason = format!(
                    "lease of {} ({}) is {}s old",
                    info.holder_id,
                    info.purpose,
                    age.as_secs()
                );
                (Some(info.holder_id), reason)
            }
        };

        tracing::warn!(path = %self.path.display(), reason = %reason, "Breaking stale lease");
        self.break_lease(stale_holder)
    }

    /// Move the lease file aside and delete it only if it is still the one judged stale
    ///
    /// Another breaker may have replaced the stale file with a fresh lease
    /// between the read and the removal; that lease is put back untouched.
    fn break_lease(&self, stale_holder: Option<Uuid>) -> bool {
        let aside = self
            .path
            .with_file_name(format!(".lease-broken-{}", Uuid::new_v4()));

        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to move stale lease aside");
                return false;
            }
        }

        let moved_holder = read_lease(&aside).map(|info| info.holder_id);
        if moved_holder != stale_holder {
            tracing::debug!(holder_id = ?moved_holder, "Lease was renewed by another breaker, restoring it");
            if let Err(e) = fs::hard_link(&aside, &self.path) {
                tracing::warn!(error = %e, "Failed to restore renewed lease");
            }
            let _ = fs::remove_file(&aside);
            return false;
        }

        if let Err(e) = fs::remove_file(&aside) {
            tracing::warn!(path = %aside.display(), error = %e, "Failed to remove broken lease");
        }
        true
    }
}

fn read_lease(path: &Path) -> Option<LeaseInfo> {
    let raw = fs::read(path).ok()?;
    serde_json::from_slice(&raw).ok()
}
