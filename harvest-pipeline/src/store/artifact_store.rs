//! Versioned Artifact Store
//!
//! Layout under the store root:
//!
//! ```text
//! CURRENT                          {"version_id": N, "updated_at": ...}
//! versions/<0000000001>/artifact.bin
//! versions/<0000000001>/record.json
//! backups/<YYYYMMDDTHHMMSS.mmmZ>-v<N>.json
//! staging/                         scratch, never referenced by CURRENT
//! promotion.lease
//! ```
//!
//! A version directory only appears under `versions/` once it is complete
//! (built in `staging/`, then renamed). `CURRENT` is only ever replaced by
//! rename of a fully written temp file. Together these mean a reader of
//! `current()` sees either the old or the new model, never a partial one.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{BackupRecord, CurrentPointer, ModelRecord, TrainingWindow};
use crate::store::lease::LeaseGuard;

pub const CURRENT_FILE: &str = "CURRENT";
pub const VERSIONS_DIR: &str = "versions";
pub const BACKUPS_DIR: &str = "backups";
pub const STAGING_DIR: &str = "staging";
pub const LEASE_FILE: &str = "promotion.lease";
const ARTIFACT_FILE: &str = "artifact.bin";
const RECORD_FILE: &str = "record.json";

/// A trained model waiting to be stored
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateModel {
    pub artifact: Vec<u8>,
    pub quality_score: f64,
    pub training_window: TrainingWindow,
    pub metrics: BTreeMap<String, f64>,
}

/// Result of a successful swap
#[derive(Debug, Clone, PartialEq)]
pub struct SwapResult {
    pub record: ModelRecord,
    /// Backup of the replaced model; `None` on bootstrap
    pub backup: Option<BackupRecord>,
}

/// Filesystem-backed store of model versions with one current pointer
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and lay out on first use) the store at `root`
    pub fn open(root: impl Into<PathBuf>) -> PipelineResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(VERSIONS_DIR))?;
        fs::create_dir_all(root.join(BACKUPS_DIR))?;
        fs::create_dir_all(root.join(STAGING_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lease_path(&self) -> PathBuf {
        self.root.join(LEASE_FILE)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn artifact_path(&self, record: &ModelRecord) -> PathBuf {
        self.root.join(&record.artifact_ref)
    }

    /// Raw pointer content; `None` before the first promotion
    pub fn current_pointer(&self) -> PipelineResult<Option<CurrentPointer>> {
        let path = self.root.join(CURRENT_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&raw).map(Some).map_err(|e| {
            corrupt(0, format!("unreadable {} pointer: {}", CURRENT_FILE, e))
        })
    }

    /// The deployed model, verified readable
    ///
    /// `ArtifactCorrupt` if the pointer references a version whose record or
    /// artifact is missing or does not match its checksum.
    pub fn current(&self) -> PipelineResult<Option<ModelRecord>> {
        let Some(pointer) = self.current_pointer()? else {
            return Ok(None);
        };

        let record = match self.read_record(pointer.version_id) {
            Ok(Some(record)) => record,
            Ok(None) => return Err(corrupt(pointer.version_id, "record.json missing".to_string())),
            Err(e) => return Err(corrupt(pointer.version_id, e.to_string())),
        };

        if let Err(reason) = self.verify(&record) {
            return Err(corrupt(pointer.version_id, reason));
        }

        Ok(Some(record))
    }

    /// Stored record of `version_id`; `ArtifactMissing` if the version is gone
    pub fn record(&self, version_id: u64) -> PipelineResult<ModelRecord> {
        self.read_record(version_id)?
            .ok_or(PipelineError::ArtifactMissing(version_id))
    }

    /// Whether the version's artifact exists and matches its record
    pub fn is_readable(&self, record: &ModelRecord) -> bool {
        self.verify(record).is_ok()
    }

    /// Back up the current model, store the candidate, then flip the pointer
    ///
    /// Any failure before the final rename leaves `CURRENT` untouched.
    pub fn propose_and_swap(
        &self,
        lease: &LeaseGuard,
        candidate: &CandidateModel,
    ) -> PipelineResult<SwapResult> {
        self.check_lease(lease)?;

        let previous = self.current()?;
        let backup = previous
            .as_ref()
            .map(|record| self.write_backup(record))
            .transpose()?;

        let record = self.stage_version(candidate)?;
        self.check_lease(lease)?;
        self.flip_pointer(record.version_id)?;

        tracing::info!(
            version_id = record.version_id,
            quality_score = record.quality_score,
            superseded = previous.as_ref().map(|r| r.version_id),
            backup_id = backup.as_ref().map(|b| b.backup_id.as_str()),
            "Model promoted"
        );

        Ok(SwapResult { record, backup })
    }

    /// Point `CURRENT` back at an earlier version
    ///
    /// `ArtifactMissing` if that version's artifact was pruned or no longer
    /// matches its checksum; the pointer is not touched in that case.
    pub fn rollback(&self, lease: &LeaseGuard, to_version_id: u64) -> PipelineResult<ModelRecord> {
        self.check_lease(lease)?;

        let record = self.record(to_version_id)?;
        if let Err(reason) = self.verify(&record) {
            tracing::warn!(version_id = to_version_id, reason = %reason, "Rollback target unreadable");
            return Err(PipelineError::ArtifactMissing(to_version_id));
        }

        self.check_lease(lease)?;
        self.flip_pointer(to_version_id)?;
        tracing::info!(version_id = to_version_id, "Rolled back current model");

        Ok(record)
    }

    /// Every stored version, oldest first
    pub fn history(&self) -> PipelineResult<Vec<ModelRecord>> {
        let mut records = Vec::new();
        for version_id in self.version_ids()? {
            match self.read_record(version_id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(version_id, error = %e, "Skipping unreadable version record"),
            }
        }
        Ok(records)
    }

    /// Every backup record, oldest first
    pub fn backups(&self) -> PipelineResult<Vec<BackupRecord>> {
        let mut backups = Vec::new();
        for entry in fs::read_dir(self.root.join(BACKUPS_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .map_err(PipelineError::from)
                .and_then(|raw| Ok(serde_json::from_slice::<BackupRecord>(&raw)?))
            {
                Ok(backup) => backups.push(backup),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable backup"),
            }
        }
        backups.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.backup_id.cmp(&b.backup_id))
        });
        Ok(backups)
    }

    pub fn latest_backup(&self) -> PipelineResult<Option<BackupRecord>> {
        Ok(self.backups()?.pop())
    }

    fn check_lease(&self, lease: &LeaseGuard) -> PipelineResult<()> {
        if lease.path() != self.lease_path() {
            return Err(PipelineError::LeaseContention(format!(
                "lease {} does not cover store {}",
                lease.path().display(),
                self.root.display()
            )));
        }
        if !lease.is_held() {
            return Err(PipelineError::LeaseContention(format!(
                "lease of {} was broken by another holder",
                lease.info().holder_id
            )));
        }
        Ok(())
    }

    fn write_backup(&self, superseded: &ModelRecord) -> PipelineResult<BackupRecord> {
        let created_at = Utc::now();
        let backup = BackupRecord {
            backup_id: backup_id(created_at, superseded.version_id),
            superseded_version_id: superseded.version_id,
            artifact_ref: superseded.artifact_ref.clone(),
            created_at,
        };

        let path = self
            .root
            .join(BACKUPS_DIR)
            .join(format!("{}.json", backup.backup_id));
        atomic_write(&path, &serde_json::to_vec_pretty(&backup)?)?;

        tracing::debug!(backup_id = %backup.backup_id, superseded = superseded.version_id, "Backup written");
        Ok(backup)
    }

    /// Persist the candidate as a complete new version without publishing it
    pub(crate) fn stage_version(&self, candidate: &CandidateModel) -> PipelineResult<ModelRecord> {
        let version_id = self.next_version_id()?;
        let version_name = version_dir_name(version_id);

        let record = ModelRecord {
            version_id,
            quality_score: candidate.quality_score,
            trained_at: Utc::now(),
            training_window: candidate.training_window.clone(),
            artifact_ref: format!("{}/{}/{}", VERSIONS_DIR, version_name, ARTIFACT_FILE),
            artifact_sha256: sha256_hex(&candidate.artifact),
            artifact_size: candidate.artifact.len() as u64,
            metrics: candidate.metrics.clone(),
        };

        let scratch = self
            .staging_dir()
            .join(format!("{}-{}", version_name, Uuid::new_v4()));
        fs::create_dir_all(&scratch)?;

        let staged = (|| -> PipelineResult<()> {
            write_synced(&scratch.join(ARTIFACT_FILE), &candidate.artifact)?;
            write_synced(&scratch.join(RECORD_FILE), &serde_json::to_vec_pretty(&record)?)?;
            sync_dir(&scratch);

            let target = self.root.join(VERSIONS_DIR).join(&version_name);
            fs::rename(&scratch, &target)?;
            sync_dir(&self.root.join(VERSIONS_DIR));
            Ok(())
        })();

        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&scratch);
            return Err(e);
        }

        tracing::debug!(version_id, size = record.artifact_size, "Version stored");
        Ok(record)
    }

    /// Replace `CURRENT` in one rename
    pub(crate) fn flip_pointer(&self, version_id: u64) -> PipelineResult<()> {
        let pointer = CurrentPointer {
            version_id,
            updated_at: Utc::now(),
        };
        atomic_write(&self.root.join(CURRENT_FILE), &serde_json::to_vec_pretty(&pointer)?)
    }

    /// One past the highest version ever stored, including unpublished ones
    fn next_version_id(&self) -> PipelineResult<u64> {
        let highest_dir = self.version_ids()?.into_iter().max().unwrap_or(0);
        let pointed = self
            .current_pointer()
            .ok()
            .flatten()
            .map(|p| p.version_id)
            .unwrap_or(0);
        Ok(highest_dir.max(pointed) + 1)
    }

    fn version_ids(&self) -> PipelineResult<Vec<u64>> {
        let mut ids: Vec<u64> = fs::read_dir(self.root.join(VERSIONS_DIR))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn read_record(&self, version_id: u64) -> PipelineResult<Option<ModelRecord>> {
        let path = self
            .root
            .join(VERSIONS_DIR)
            .join(version_dir_name(version_id))
            .join(RECORD_FILE);

        match fs::read(&path) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn verify(&self, record: &ModelRecord) -> Result<(), String> {
        let path = self.artifact_path(record);
        let bytes = fs::read(&path).map_err(|e| format!("{}: {}", path.display(), e))?;

        if bytes.len() as u64 != record.artifact_size {
            return Err(format!(
                "size {} does not match recorded {}",
                bytes.len(),
                record.artifact_size
            ));
        }

        let digest = sha256_hex(&bytes);
        if digest != record.artifact_sha256 {
            return Err(format!(
                "sha256 {} does not match recorded {}",
                digest, record.artifact_sha256
            ));
        }

        Ok(())
    }
}

fn corrupt(version_id: u64, reason: String) -> PipelineError {
    tracing::error!(
        alert = true,
        version_id,
        reason = %reason,
        "Current model artifact is unreadable"
    );
    PipelineError::ArtifactCorrupt { version_id, reason }
}

fn version_dir_name(version_id: u64) -> String {
    format!("{:010}", version_id)
}

fn backup_id(created_at: DateTime<Utc>, superseded: u64) -> String {
    format!("{}-v{}", created_at.format("%Y%m%dT%H%M%S%.3fZ"), superseded)
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn write_synced(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Write to `<path>.tmp`, fsync, then rename over `path`
fn atomic_write(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    let tmp = path.with_extension("tmp");
    write_synced(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

/// Persist directory entries (renames) where the platform supports it
fn sync_dir(dir: &Path) {
    if cfg!(unix) {
        if let Ok(handle) = fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::lease::PromotionLease;
    use chrono::NaiveDate;
    use std::time::Duration;
    use tempfile::TempDir;

    fn candidate(bytes: &[u8], score: f64) -> CandidateModel {
        CandidateModel {
            artifact: bytes.to_vec(),
            quality_score: score,
            training_window: TrainingWindow {
                first_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                last_date: NaiveDate::from_ymd_opt(2024, 1, 20).unwrap(),
                snapshot_count: 60,
            },
            metrics: BTreeMap::new(),
        }
    }

    async fn lease_for(store: &ArtifactStore) -> LeaseGuard {
        PromotionLease::new(store.lease_path(), Duration::from_secs(60), Duration::ZERO)
            .acquire("test")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_store_has_no_current() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        assert!(store.current().unwrap().is_none());
        assert!(store.history().unwrap().is_empty());
        assert!(store.latest_backup().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_swap_writes_no_backup() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let lease = lease_for(&store).await;

        let swap = store.propose_and_swap(&lease, &candidate(b"v1", 0.7)).unwrap();
        assert_eq!(swap.record.version_id, 1);
        assert!(swap.backup.is_none());
        assert_eq!(store.current().unwrap(), Some(swap.record.clone()));
        assert_eq!(fs::read(store.artifact_path(&swap.record)).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn test_interrupted_swap_keeps_prior_current() {
        let dir = TempDir::new().unwrap();
        let before = {
            let store = ArtifactStore::open(dir.path()).unwrap();
            let lease = lease_for(&store).await;
            let first = store.propose_and_swap(&lease, &candidate(b"v1", 0.7)).unwrap();

            // Process dies after the new version is written, before the flip
            store.write_backup(&first.record).unwrap();
            store.stage_version(&candidate(b"v2-partial-run", 0.9)).unwrap();
            // Leftover temp pointer from an interrupted write
            fs::write(dir.path().join("CURRENT.tmp"), b"{\"version_id\": 2").unwrap();
            first.record
        };

        let reopened = ArtifactStore::open(dir.path()).unwrap();
        assert_eq!(reopened.current().unwrap(), Some(before));

        // The orphan still reserves its id
        let lease = lease_for(&reopened).await;
        let next = reopened.propose_and_swap(&lease, &candidate(b"v3", 0.95)).unwrap();
        assert_eq!(next.record.version_id, 3);
    }

    #[tokio::test]
    async fn test_corrupt_current_artifact_detected() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let lease = lease_for(&store).await;
        let swap = store.propose_and_swap(&lease, &candidate(b"good", 0.7)).unwrap();

        fs::write(store.artifact_path(&swap.record), b"bad!").unwrap();
        match store.current().unwrap_err() {
            PipelineError::ArtifactCorrupt { version_id, .. } => assert_eq!(version_id, 1),
            other => panic!("unexpected error {:?}", other),
        }

        fs::remove_file(store.artifact_path(&swap.record)).unwrap();
        assert!(matches!(
            store.current().unwrap_err(),
            PipelineError::ArtifactCorrupt { .. }
        ));
    }

    #[tokio::test]
    async fn test_rollback_to_pruned_version_fails() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let lease = lease_for(&store).await;

        let first = store.propose_and_swap(&lease, &candidate(b"v1", 0.7)).unwrap();
        let second = store.propose_and_swap(&lease, &candidate(b"v2", 0.8)).unwrap();
        fs::remove_file(store.artifact_path(&first.record)).unwrap();

        let err = store.rollback(&lease, 1).unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactMissing(1)));
        assert!(matches!(
            store.rollback(&lease, 42).unwrap_err(),
            PipelineError::ArtifactMissing(42)
        ));
        assert_eq!(store.current().unwrap(), Some(second.record));
    }

    #[tokio::test]
    async fn test_foreign_lease_rejected() {
        let store_dir = TempDir::new().unwrap();
        let other_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(store_dir.path()).unwrap();
        let other = ArtifactStore::open(other_dir.path()).unwrap();
        let foreign = lease_for(&other).await;

        assert!(matches!(
            store.propose_and_swap(&foreign, &candidate(b"x", 0.5)).unwrap_err(),
            PipelineError::LeaseContention(_)
        ));
    }

    #[tokio::test]
    async fn test_broken_lease_cannot_swap_or_rollback() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let slow = lease_for(&store).await;
        let first = store.propose_and_swap(&slow, &candidate(b"v1", 0.4)).unwrap();

        // A later run judges the slow holder's lease stale and takes over
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fresh = PromotionLease::new(store.lease_path(), Duration::from_millis(1), Duration::ZERO)
            .acquire("test")
            .await
            .unwrap();
        let newer = store.propose_and_swap(&fresh, &candidate(b"v2", 0.6)).unwrap();

        // The old holder can no longer move the pointer
        assert!(matches!(
            store.propose_and_swap(&slow, &candidate(b"v3", 0.5)).unwrap_err(),
            PipelineError::LeaseContention(_)
        ));
        assert!(matches!(
            store.rollback(&slow, first.record.version_id).unwrap_err(),
            PipelineError::LeaseContention(_)
        ));
        assert_eq!(store.current().unwrap(), Some(newer.record));
    }

    #[test]
    fn test_backup_id_format() {
        let at = DateTime::parse_from_rfc3339("2024-03-05T07:08:09.123Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(backup_id(at, 12), "20240305T070809.123Z-v12");
        assert_eq!(version_dir_name(7), "0000000007");
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
