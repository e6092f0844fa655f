//! Collection run log
//!
//! Append-only: one row per Collector invocation, never updated.

use chrono::NaiveDate;
use harvest_common::time::{format_date, parse_date, parse_timestamp};
use harvest_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{CollectionRun, EntityFailure};
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// Append a finished collection run
pub async fn save_run(pool: &SqlitePool, run: &CollectionRun) -> Result<()> {
    let run_id = run.run_id.to_string();
    let run_date = format_date(run.run_date);
    let failed = serde_json::to_string(&run.entities_failed)
        .map_err(|e| Error::Internal(format!("Failed to serialize failures: {}", e)))?;
    let started_at = run.started_at.to_rfc3339();
    let finished_at = run.finished_at.to_rfc3339();

    retry_on_lock("save_collection_run", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO collection_runs (
                run_id, run_date, entities_attempted, entities_succeeded,
                entities_failed, started_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run_id)
        .bind(&run_date)
        .bind(run.entities_attempted as i64)
        .bind(run.entities_succeeded as i64)
        .bind(&failed)
        .bind(&started_at)
        .bind(&finished_at)
        .execute(pool)
        .await?;

        Ok(())
    })
    .await
}

/// Most recent runs, newest first
pub async fn latest_runs(pool: &SqlitePool, limit: usize) -> Result<Vec<CollectionRun>> {
    let rows = sqlx::query(
        r#"
        SELECT run_id, run_date, entities_attempted, entities_succeeded,
               entities_failed, started_at, finished_at
        FROM collection_runs
        ORDER BY finished_at DESC
        LIMIT ?
        "#,
    )
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.iter().map(run_from_row).collect()
}

/// Latest run recorded for a given collection day
pub async fn latest_run_for_date(pool: &SqlitePool, date: NaiveDate) -> Result<Option<CollectionRun>> {
    let row = sqlx::query(
        r#"
        SELECT run_id, run_date, entities_attempted, entities_succeeded,
               entities_failed, started_at, finished_at
        FROM collection_runs
        WHERE run_date = ?
        ORDER BY finished_at DESC
        LIMIT 1
        "#,
    )
    .bind(format_date(date))
    .fetch_optional(pool)
    .await?;

    row.map(|r| run_from_row(&r)).transpose()
}

fn run_from_row(row: &SqliteRow) -> Result<CollectionRun> {
    let run_id: String = row.get("run_id");
    let run_date: String = row.get("run_date");
    let failed: String = row.get("entities_failed");
    let started_at: String = row.get("started_at");
    let finished_at: String = row.get("finished_at");
    let attempted: i64 = row.get("entities_attempted");
    let succeeded: i64 = row.get("entities_succeeded");

    let entities_failed: Vec<EntityFailure> = serde_json::from_str(&failed)
        .map_err(|e| Error::Internal(format!("Failed to deserialize failures: {}", e)))?;

    Ok(CollectionRun {
        run_id: Uuid::parse_str(&run_id)
            .map_err(|e| Error::Internal(format!("Invalid run_id '{}': {}", run_id, e)))?,
        run_date: parse_date(&run_date)?,
        entities_attempted: attempted as usize,
        entities_succeeded: succeeded as usize,
        entities_failed,
        started_at: parse_timestamp(&started_at)?,
        finished_at: parse_timestamp(&finished_at)?,
    })
}
