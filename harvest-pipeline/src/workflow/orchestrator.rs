//! Pipeline orchestrator
//!
//! Sequences the two cadences:
//! - daily:  IDLE → COLLECTING → IDLE
//! - weekly: IDLE → EVALUATING → SKIPPED
//!                             → TRAINING → VALIDATING → PROMOTED | REJECTED
//!
//! The promotion lease is held from EVALUATING until the weekly run ends,
//! so no two runs train, validate or swap against the same store at once.
//! Cancellation is checked between states and raced against the trainer.

use chrono::NaiveDate;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::db::{retrain_runs, snapshots};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    Cadence, CollectionRun, ModelRecord, OutcomeReason, OutcomeStatus, PipelineState, RunOutcome,
    TrainingWindow,
};
use crate::services::{
    resolve_tracked_entities, retry_targets, Collector, CoverageEvaluator, MetricsSource,
    PromotionGate, Trainer,
};
use crate::store::{ArtifactStore, CandidateModel, LeaseGuard, PromotionLease};

/// Options of one daily invocation
#[derive(Debug, Clone)]
pub struct DailyOptions {
    /// Collection day (normally today, UTC)
    pub as_of: NaiveDate,
    /// Explicit entity set replacing the tracked set for this run
    pub entities: Option<BTreeSet<String>>,
    /// Only re-collect entities that failed earlier for `as_of`
    pub retry_failed: bool,
}

impl Default for DailyOptions {
    fn default() -> Self {
        Self {
            as_of: harvest_common::time::today(),
            entities: None,
            retry_failed: false,
        }
    }
}

/// Options of one weekly invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeeklyOptions {
    /// Skip the minimum-new-days check
    pub force: bool,
    /// Evaluate, train and validate but never mutate the Artifact Store
    pub dry_run: bool,
}

pub struct Orchestrator {
    db: SqlitePool,
    config: PipelineConfig,
    root_folder: PathBuf,
    store: ArtifactStore,
    lease: PromotionLease,
    collector: Collector,
    coverage: CoverageEvaluator,
    gate: PromotionGate,
    trainer: Arc<dyn Trainer>,
}

impl Orchestrator {
    pub fn new(
        db: SqlitePool,
        config: PipelineConfig,
        root_folder: PathBuf,
        store: ArtifactStore,
        source: Arc<dyn MetricsSource>,
        trainer: Arc<dyn Trainer>,
    ) -> Self {
        let lease = PromotionLease::new(store.lease_path(), config.lease_stale_after, config.lease_wait);
        let collector = Collector::new(
            db.clone(),
            source,
            config.fetch_concurrency,
            config.fetch_timeout,
        );

        Self {
            coverage: CoverageEvaluator::new(db.clone()),
            gate: PromotionGate::new(config.improvement_threshold),
            db,
            config,
            root_folder,
            store,
            lease,
            collector,
            trainer,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Entities a daily run would collect without overrides
    pub async fn tracked_entities(&self) -> PipelineResult<BTreeSet<String>> {
        resolve_tracked_entities(&self.db, &self.config, &self.root_folder).await
    }

    /// Daily cadence: collect one snapshot per tracked entity
    ///
    /// Partial failure is a successful run; `CollectionFailed` only when
    /// every attempted entity failed.
    pub async fn run_daily(
        &self,
        options: &DailyOptions,
        cancel: &CancellationToken,
    ) -> PipelineResult<CollectionRun> {
        log_transition(Cadence::Daily, PipelineState::Idle, PipelineState::Collecting);

        let entities = self.daily_entities(options).await?;
        if entities.is_empty() {
            tracing::warn!(as_of = %options.as_of, "No entities to collect");
        }

        let run = self.collector.collect(&entities, options.as_of, cancel).await?;

        log_transition(Cadence::Daily, PipelineState::Collecting, PipelineState::Idle);

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        if run.is_total_failure() {
            tracing::error!(
                run_id = %run.run_id,
                attempted = run.entities_attempted,
                "Every entity failed during collection"
            );
            return Err(PipelineError::CollectionFailed {
                attempted: run.entities_attempted,
            });
        }

        Ok(run)
    }

    /// Weekly cadence: evaluate, train, validate and (maybe) promote
    ///
    /// Never returns an error: every failure is folded into the returned
    /// outcome with status `FAILED`. The outcome is logged and persisted.
    pub async fn run_weekly(&self, options: WeeklyOptions, cancel: &CancellationToken) -> RunOutcome {
        let mut outcome = RunOutcome::new(
            Cadence::Weekly,
            self.gate.threshold(),
            options.dry_run,
            options.force,
        );

        tracing::info!(
            run_id = %outcome.run_id,
            force = options.force,
            dry_run = options.dry_run,
            "Weekly run started"
        );

        if let Err(err) = self.weekly_sequence(&mut outcome, options, cancel).await {
            record_failure(&mut outcome, err);
        }

        if let Err(e) = retrain_runs::save_outcome(&self.db, &outcome).await {
            tracing::error!(run_id = %outcome.run_id, error = %e, "Failed to persist retrain outcome");
        }

        emit_outcome(&outcome);
        outcome
    }

    /// Point the deployed model back at `to_version_id`
    ///
    /// Without a version, targets the model superseded by the latest backup.
    pub async fn rollback(&self, to_version_id: Option<u64>) -> PipelineResult<ModelRecord> {
        let guard = self.lease.acquire("rollback").await?;

        let target = match to_version_id {
            Some(version_id) => version_id,
            None => self
                .store
                .latest_backup()?
                .map(|backup| backup.superseded_version_id)
                .ok_or_else(|| {
                    PipelineError::Common(harvest_common::Error::NotFound(
                        "no backup to roll back to".to_string(),
                    ))
                })?,
        };

        self.store.rollback(&guard, target)
    }

    async fn daily_entities(&self, options: &DailyOptions) -> PipelineResult<BTreeSet<String>> {
        let disabled = self.config.disabled_entities();

        let entities = if let Some(explicit) = &options.entities {
            explicit.clone()
        } else if options.retry_failed {
            let targets = retry_targets(&self.db, options.as_of).await?;
            tracing::info!(as_of = %options.as_of, entities = targets.len(), "Retrying failed entities");
            targets
        } else {
            self.tracked_entities().await?
        };

        Ok(entities.into_iter().filter(|e| !disabled.contains(e)).collect())
    }

    async fn weekly_sequence(
        &self,
        outcome: &mut RunOutcome,
        options: WeeklyOptions,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        check_cancelled(cancel)?;

        // EVALUATING
        outcome.transition_to(PipelineState::Evaluating);
        let guard = self.lease.acquire("weekly").await?;

        let current = self.store.current()?;
        outcome.current_version = current.as_ref().map(|r| r.version_id);
        outcome.current_score = current.as_ref().map(|r| r.quality_score);

        let decision = self
            .coverage
            .evaluate(current.as_ref(), self.config.min_new_days, options.force)
            .await?;
        let total_day_count = self.coverage.total_day_count().await?;
        outcome.decision = Some(decision);
        outcome.total_day_count = Some(total_day_count);

        tracing::info!(
            run_id = %outcome.run_id,
            new_day_count = decision.new_day_count,
            total_day_count,
            min_new_days = self.config.min_new_days,
            reason = ?decision.reason,
            "Coverage evaluated"
        );

        if !decision.triggered {
            outcome.transition_to(PipelineState::Skipped);
            outcome.finish(
                OutcomeStatus::Skipped,
                OutcomeReason::InsufficientNewData,
                Some(format!(
                    "{} new days since last training, {} required",
                    decision.new_day_count, self.config.min_new_days
                )),
            );
            return Ok(());
        }

        check_cancelled(cancel)?;

        // TRAINING
        outcome.transition_to(PipelineState::Training);
        let candidate = self.train(cancel).await?;
        outcome.candidate_score = Some(candidate.quality_score);

        check_cancelled(cancel)?;

        // VALIDATING
        outcome.transition_to(PipelineState::Validating);
        let gate = self
            .gate
            .decide(candidate.quality_score, outcome.current_score);
        outcome.margin = gate.margin;

        tracing::info!(
            run_id = %outcome.run_id,
            candidate_score = candidate.quality_score,
            current_score = ?outcome.current_score,
            margin = ?gate.margin,
            threshold = self.gate.threshold(),
            promote = gate.promote,
            "Promotion gate evaluated"
        );

        if !gate.promote {
            outcome.transition_to(PipelineState::Rejected);
            outcome.finish(OutcomeStatus::Rejected, gate.reason, None);
            return Ok(());
        }

        if options.dry_run {
            outcome.transition_to(PipelineState::Promoted);
            outcome.finish(
                OutcomeStatus::Promoted,
                gate.reason,
                Some("dry run: artifact store not modified".to_string()),
            );
            return Ok(());
        }

        check_cancelled(cancel)?;
        self.promote(outcome, &guard, &candidate)?;
        outcome.transition_to(PipelineState::Promoted);
        outcome.finish(OutcomeStatus::Promoted, gate.reason, None);

        Ok(())
    }

    async fn train(&self, cancel: &CancellationToken) -> PipelineResult<CandidateModel> {
        let through = harvest_common::time::today();

        // The window describes exactly the snapshots handed to the trainer
        let snapshots = snapshots::load_snapshots_through(&self.db, through).await?;
        let window = match TrainingWindow::covering(&snapshots) {
            Some(window) if window.snapshot_count >= self.config.min_training_snapshots => window,
            _ => {
                return Err(PipelineError::TrainingFailed(format!(
                    "insufficient training data: {} snapshots, {} required",
                    snapshots.len(),
                    self.config.min_training_snapshots
                )))
            }
        };

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = self.trainer.train(&snapshots, &window) => result?,
        };

        if !output.quality_score.is_finite() {
            return Err(PipelineError::TrainingFailed(format!(
                "non-finite quality score {}",
                output.quality_score
            )));
        }
        if output.artifact.is_empty() {
            return Err(PipelineError::TrainingFailed("empty artifact".to_string()));
        }

        Ok(CandidateModel {
            artifact: output.artifact,
            quality_score: output.quality_score,
            training_window: window,
            metrics: output.metrics,
        })
    }

    fn promote(
        &self,
        outcome: &mut RunOutcome,
        guard: &LeaseGuard,
        candidate: &CandidateModel,
    ) -> PipelineResult<()> {
        let swap = self.store.propose_and_swap(guard, candidate)?;
        outcome.promoted_version = Some(swap.record.version_id);
        outcome.backup_id = swap.backup.map(|b| b.backup_id);
        Ok(())
    }
}

fn check_cancelled(cancel: &CancellationToken) -> PipelineResult<()> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

fn log_transition(cadence: Cadence, from: PipelineState, to: PipelineState) {
    tracing::debug!(cadence = %cadence, from = ?from, to = ?to, "State transition");
}

/// Fold an error into the outcome record
///
/// A trainer failure rejects the candidate; anything else fails the run.
fn record_failure(outcome: &mut RunOutcome, err: PipelineError) {
    let (state, reason) = match &err {
        PipelineError::TrainingFailed(_) => (PipelineState::Rejected, OutcomeReason::TrainingFailed),
        PipelineError::Cancelled => (PipelineState::Failed, OutcomeReason::Cancelled),
        _ => (PipelineState::Failed, OutcomeReason::Error),
    };

    tracing::warn!(run_id = %outcome.run_id, error = %err, state = ?outcome.state, "Weekly run aborted");

    outcome.transition_to(state);
    outcome.finish(OutcomeStatus::Failed, reason, Some(err.to_string()));
}

/// Emit the structured outcome record
fn emit_outcome(outcome: &RunOutcome) {
    let status = outcome.status.map(|s| s.as_str()).unwrap_or("UNKNOWN");
    let reason = outcome.reason.map(|r| format!("{:?}", r)).unwrap_or_default();
    let new_day_count = outcome.decision.map(|d| d.new_day_count);

    macro_rules! outcome_event {
        ($level:ident) => {
            tracing::$level!(
                run_id = %outcome.run_id,
                status,
                reason = %reason,
                dry_run = outcome.dry_run,
                forced = outcome.forced,
                new_day_count = ?new_day_count,
                total_day_count = ?outcome.total_day_count,
                current_version = ?outcome.current_version,
                current_score = ?outcome.current_score,
                candidate_score = ?outcome.candidate_score,
                margin = ?outcome.margin,
                threshold = outcome.threshold,
                promoted_version = ?outcome.promoted_version,
                detail = ?outcome.detail,
                "Retrain outcome"
            )
        };
    }

    match outcome.status {
        Some(OutcomeStatus::Failed) => outcome_event!(error),
        _ => outcome_event!(info),
    }
}
