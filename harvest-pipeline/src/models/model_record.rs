//! Deployed model metadata, backups and the current pointer

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Snapshot;

/// Range of snapshot data a model was trained on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingWindow {
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub snapshot_count: usize,
}

impl TrainingWindow {
    /// Date range and count of exactly these snapshots; `None` when empty
    pub fn covering(snapshots: &[Snapshot]) -> Option<Self> {
        let first_date = snapshots.iter().map(|s| s.date).min()?;
        let last_date = snapshots.iter().map(|s| s.date).max()?;
        Some(Self {
            first_date,
            last_date,
            snapshot_count: snapshots.len(),
        })
    }
}

/// Metadata of one stored model version
///
/// `version_id` is strictly increasing across the store. The record is
/// written once, next to its artifact, and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub version_id: u64,
    /// Goodness-of-fit reported by the trainer (e.g. R², at most 1.0)
    pub quality_score: f64,
    pub trained_at: DateTime<Utc>,
    pub training_window: TrainingWindow,
    /// Artifact location relative to the store root
    pub artifact_ref: String,
    pub artifact_sha256: String,
    pub artifact_size: u64,
    /// Auxiliary metrics reported by the trainer
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

/// Written immediately before every promotion, pointing at the model being replaced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    pub superseded_version_id: u64,
    pub artifact_ref: String,
    pub created_at: DateTime<Utc>,
}

/// Content of the single mutable "current" pointer file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentPointer {
    pub version_id: u64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entity_id: &str, day: u32) -> Snapshot {
        Snapshot {
            entity_id: entity_id.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 4, day).unwrap(),
            metrics: BTreeMap::new(),
            readings: Vec::new(),
            collected_at: Utc::now(),
        }
    }

    #[test]
    fn test_window_covers_loaded_snapshots() {
        assert!(TrainingWindow::covering(&[]).is_none());

        let loaded = [snapshot("a", 6), snapshot("b", 2), snapshot("a", 2)];
        let window = TrainingWindow::covering(&loaded).unwrap();

        assert_eq!(window.first_date, NaiveDate::from_ymd_opt(2024, 4, 2).unwrap());
        assert_eq!(window.last_date, NaiveDate::from_ymd_opt(2024, 4, 6).unwrap());
        assert_eq!(window.snapshot_count, 3);
    }
}
