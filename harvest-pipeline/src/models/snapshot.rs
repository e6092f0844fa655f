//! Tracked entities and their daily snapshots

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named numeric fields observed for one entity on one day
pub type Metrics = BTreeMap<String, f64>;

/// An entity whose usage is collected daily (e.g. a map code)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub entity_id: String,
    pub enabled: bool,
}

impl TrackedEntity {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            enabled: true,
        }
    }
}

/// One entity's observed metrics for one UTC calendar day
///
/// At most one snapshot exists per `(entity_id, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity_id: String,
    pub date: NaiveDate,
    pub metrics: Metrics,
    /// Raw usage series returned by the upstream for this collection
    #[serde(default)]
    pub readings: Vec<f64>,
    pub collected_at: DateTime<Utc>,
}
