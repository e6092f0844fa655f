//! Retrain outcome log

use harvest_common::{Error, Result};
use sqlx::SqlitePool;

use crate::models::RunOutcome;
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// Persist a finished weekly run outcome
///
/// The full record is kept as JSON; `status` and `cadence` are duplicated
/// into columns for listing.
pub async fn save_outcome(pool: &SqlitePool, outcome: &RunOutcome) -> Result<()> {
    let run_id = outcome.run_id.to_string();
    let status = outcome
        .status
        .map(|s| s.as_str().to_string())
        .ok_or_else(|| Error::InvalidInput("outcome has no status".to_string()))?;
    let body = serde_json::to_string(outcome)
        .map_err(|e| Error::Internal(format!("Failed to serialize outcome: {}", e)))?;
    let started_at = outcome.started_at.to_rfc3339();
    let finished_at = outcome.finished_at.unwrap_or_else(chrono::Utc::now).to_rfc3339();

    retry_on_lock("save_retrain_outcome", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO retrain_runs (run_id, cadence, status, dry_run, outcome, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run_id)
        .bind(outcome.cadence.to_string())
        .bind(&status)
        .bind(outcome.dry_run)
        .bind(&body)
        .bind(&started_at)
        .bind(&finished_at)
        .execute(pool)
        .await?;

        Ok(())
    })
    .await
}

/// Most recent outcomes, newest first
pub async fn latest_outcomes(pool: &SqlitePool, limit: usize) -> Result<Vec<RunOutcome>> {
    let bodies: Vec<String> = sqlx::query_scalar(
        "SELECT outcome FROM retrain_runs ORDER BY finished_at DESC LIMIT ?",
    )
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    bodies
        .iter()
        .map(|body| {
            serde_json::from_str(body)
                .map_err(|e| Error::Internal(format!("Failed to deserialize outcome: {}", e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cadence, OutcomeReason, OutcomeStatus, PipelineState};
    use harvest_common::db::init_memory_database;

    #[tokio::test]
    async fn test_unfinished_outcome_is_rejected() {
        let pool = init_memory_database().await.unwrap();
        let outcome = RunOutcome::new(Cadence::Weekly, 0.01, false, false);

        let err = save_outcome(&pool, &outcome).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let pool = init_memory_database().await.unwrap();

        let mut first = RunOutcome::new(Cadence::Weekly, 0.01, false, false);
        first.transition_to(PipelineState::Evaluating);
        first.transition_to(PipelineState::Skipped);
        first.finish(OutcomeStatus::Skipped, OutcomeReason::InsufficientNewData, None);
        save_outcome(&pool, &first).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let mut second = RunOutcome::new(Cadence::Weekly, 0.01, true, true);
        second.candidate_score = Some(0.8);
        second.finish(OutcomeStatus::Promoted, OutcomeReason::Bootstrap, None);
        save_outcome(&pool, &second).await.unwrap();

        let outcomes = latest_outcomes(&pool, 10).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].run_id, second.run_id);
        assert_eq!(outcomes[0].candidate_score, Some(0.8));
        assert_eq!(outcomes[1], first);
    }
}
