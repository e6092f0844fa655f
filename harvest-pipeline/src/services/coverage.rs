//! Coverage Evaluator
//!
//! Pure reads over the Snapshot Store. A date counts once at least one
//! entity has a snapshot for it; entities need not be synchronized.

use chrono::NaiveDate;
use sqlx::SqlitePool;

use crate::db::snapshots;
use crate::error::PipelineResult;
use crate::models::{ModelRecord, RetrainDecision};

pub struct CoverageEvaluator {
    db: SqlitePool,
}

impl CoverageEvaluator {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Distinct snapshot dates strictly after `since`
    pub async fn new_day_count(&self, since: NaiveDate) -> PipelineResult<usize> {
        Ok(snapshots::count_dates_after(&self.db, since).await?)
    }

    /// Distinct snapshot dates in the whole store
    pub async fn total_day_count(&self) -> PipelineResult<usize> {
        Ok(snapshots::count_dates(&self.db).await?)
    }

    /// Decide whether to train, measured from the current model's window
    ///
    /// With no model deployed the count starts at the Unix epoch.
    pub async fn evaluate(
        &self,
        current: Option<&ModelRecord>,
        min_new_days: u32,
        force: bool,
    ) -> PipelineResult<RetrainDecision> {
        let since = coverage_start(current);
        let new_day_count = self.new_day_count(since).await?;
        Ok(RetrainDecision::evaluate(new_day_count, min_new_days as usize, force))
    }
}

/// Last day already covered by the deployed model
pub fn coverage_start(current: Option<&ModelRecord>) -> NaiveDate {
    current
        .map(|record| record.training_window.last_date)
        .unwrap_or_else(harvest_common::time::epoch_date)
}
