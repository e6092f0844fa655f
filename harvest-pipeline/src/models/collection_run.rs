//! Collector run log entries

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Classification of a per-entity collection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Upstream does not know the entity
    NotFound,
    /// Network error or upstream error status
    Unavailable,
    /// Upstream answered with something we cannot use
    Malformed,
    /// Fetch exceeded its deadline
    Timeout,
    /// Snapshot could not be written
    Storage,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::NotFound => "not_found",
            FetchErrorKind::Unavailable => "unavailable",
            FetchErrorKind::Malformed => "malformed",
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Storage => "storage",
        }
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed entity within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFailure {
    pub entity_id: String,
    pub kind: FetchErrorKind,
    pub message: String,
}

/// Summary of one Collector invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRun {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub entities_attempted: usize,
    pub entities_succeeded: usize,
    pub entities_failed: Vec<EntityFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CollectionRun {
    /// True when at least one entity was attempted and none succeeded
    pub fn is_total_failure(&self) -> bool {
        self.entities_attempted > 0 && self.entities_succeeded == 0
    }

    pub fn failed_entity_ids(&self) -> Vec<&str> {
        self.entities_failed
            .iter()
            .map(|f| f.entity_id.as_str())
            .collect()
    }

    /// Number of failures of the given kind
    pub fn failures_of_kind(&self, kind: FetchErrorKind) -> usize {
        self.entities_failed.iter().filter(|f| f.kind == kind).count()
    }
}
