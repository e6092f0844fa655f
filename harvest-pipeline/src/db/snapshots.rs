//! Snapshot Store
//!
//! Append-only, per-entity, per-day records. A write for an existing
//! `(entity_id, date)` overwrites in place, but only while that date is
//! still the current UTC day; earlier days are sealed.

use chrono::NaiveDate;
use harvest_common::time::{format_date, parse_date, parse_timestamp};
use harvest_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;

use crate::models::{Metrics, Snapshot};
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// Insert or overwrite the snapshot for `(entity_id, date)`
///
/// `today` is the current UTC day. Overwriting a snapshot whose date is
/// before `today` is refused with `Error::Conflict`; inserting a missing
/// past day is allowed (late collection of a day never observed).
pub async fn upsert_snapshot(pool: &SqlitePool, snapshot: &Snapshot, today: NaiveDate) -> Result<()> {
    // Prepare all data BEFORE acquiring database connection
    let date = format_date(snapshot.date);
    let today = format_date(today);
    let metrics = serde_json::to_string(&snapshot.metrics)
        .map_err(|e| Error::Internal(format!("Failed to serialize metrics: {}", e)))?;
    let readings = serde_json::to_string(&snapshot.readings)
        .map_err(|e| Error::Internal(format!("Failed to serialize readings: {}", e)))?;
    let collected_at = snapshot.collected_at.to_rfc3339();

    let rows_affected = retry_on_lock("upsert_snapshot", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            INSERT INTO snapshots (entity_id, date, metrics, readings, collected_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(entity_id, date) DO UPDATE SET
                metrics = excluded.metrics,
                readings = excluded.readings,
                collected_at = excluded.collected_at
            WHERE excluded.date >= ?
            "#,
        )
        .bind(&snapshot.entity_id)
        .bind(&date)
        .bind(&metrics)
        .bind(&readings)
        .bind(&collected_at)
        .bind(&today)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    })
    .await?;

    if rows_affected == 0 {
        return Err(Error::Conflict(format!(
            "snapshot for {} on {} is sealed",
            snapshot.entity_id, date
        )));
    }

    Ok(())
}

/// Load one snapshot
pub async fn get_snapshot(
    pool: &SqlitePool,
    entity_id: &str,
    date: NaiveDate,
) -> Result<Option<Snapshot>> {
    let row = sqlx::query(
        r#"
        SELECT entity_id, date, metrics, readings, collected_at
        FROM snapshots
        WHERE entity_id = ? AND date = ?
        "#,
    )
    .bind(entity_id)
    .bind(format_date(date))
    .fetch_optional(pool)
    .await?;

    row.map(|r| snapshot_from_row(&r)).transpose()
}

/// All snapshots dated on or before `through`, oldest first
pub async fn load_snapshots_through(pool: &SqlitePool, through: NaiveDate) -> Result<Vec<Snapshot>> {
    let rows = sqlx::query(
        r#"
        SELECT entity_id, date, metrics, readings, collected_at
        FROM snapshots
        WHERE date <= ?
        ORDER BY date ASC, entity_id ASC
        "#,
    )
    .bind(format_date(through))
    .fetch_all(pool)
    .await?;

    rows.iter().map(snapshot_from_row).collect()
}

/// Number of distinct snapshot dates strictly after `since`, across all entities
///
/// Runs as a single statement, so it reads one consistent view even while
/// collection is writing: at worst it misses rows committed afterwards.
pub async fn count_dates_after(pool: &SqlitePool, since: NaiveDate) -> Result<usize> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT date) FROM snapshots WHERE date > ?")
        .bind(format_date(since))
        .fetch_one(pool)
        .await?;

    Ok(count as usize)
}

/// Number of distinct snapshot dates in the store
pub async fn count_dates(pool: &SqlitePool) -> Result<usize> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT date) FROM snapshots")
        .fetch_one(pool)
        .await?;

    Ok(count as usize)
}

/// Every entity that has at least one snapshot
pub async fn list_entity_ids(pool: &SqlitePool) -> Result<BTreeSet<String>> {
    let ids: Vec<String> = sqlx::query_scalar("SELECT DISTINCT entity_id FROM snapshots")
        .fetch_all(pool)
        .await?;

    Ok(ids.into_iter().collect())
}

/// Entities that have a snapshot for `date`
pub async fn entities_collected_on(pool: &SqlitePool, date: NaiveDate) -> Result<BTreeSet<String>> {
    let ids: Vec<String> = sqlx::query_scalar("SELECT entity_id FROM snapshots WHERE date = ?")
        .bind(format_date(date))
        .fetch_all(pool)
        .await?;

    Ok(ids.into_iter().collect())
}

fn snapshot_from_row(row: &SqliteRow) -> Result<Snapshot> {
    let date: String = row.get("date");
    let metrics: String = row.get("metrics");
    let readings: String = row.get("readings");
    let collected_at: String = row.get("collected_at");

    let metrics: Metrics = serde_json::from_str(&metrics)
        .map_err(|e| Error::Internal(format!("Failed to deserialize metrics: {}", e)))?;
    let readings: Vec<f64> = serde_json::from_str(&readings)
        .map_err(|e| Error::Internal(format!("Failed to deserialize readings: {}", e)))?;

    Ok(Snapshot {
        entity_id: row.get("entity_id"),
        date: parse_date(&date)?,
        metrics,
        readings,
        collected_at: parse_timestamp(&collected_at)?,
    })
}
