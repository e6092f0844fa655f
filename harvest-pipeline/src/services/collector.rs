//! Collector
//!
//! Fetches metrics for every tracked entity with bounded concurrency and
//! upserts one snapshot per entity for the collection day. Each fetch has
//! its own deadline; a failed or hung entity never blocks the others.

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::db::{collection_runs, snapshots};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CollectionRun, EntityFailure, FetchErrorKind, Snapshot};
use crate::services::metrics_client::MetricsSource;

/// Curated entity list kept in the root folder
pub const TRACKED_ENTITIES_FILE: &str = "tracked_maps.json";

#[derive(Debug, Deserialize)]
struct TrackedEntitiesFile {
    #[serde(default)]
    maps: Vec<String>,
}

/// Per-entity result inside one run
enum EntityResult {
    Stored,
    Failed(EntityFailure),
    /// Not attempted because the run was cancelled
    Skipped,
}

/// Collector for one Snapshot Store
pub struct Collector {
    db: SqlitePool,
    source: Arc<dyn MetricsSource>,
    concurrency: usize,
    fetch_timeout: Duration,
}

impl Collector {
    pub fn new(
        db: SqlitePool,
        source: Arc<dyn MetricsSource>,
        concurrency: usize,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            db,
            source,
            concurrency: concurrency.max(1),
            fetch_timeout,
        }
    }

    /// Collect one snapshot per entity for `as_of` and append the run to the log
    ///
    /// Per-entity failures are recorded in the returned run, never returned
    /// as errors. Entities not yet started when `cancel` fires are not
    /// attempted; snapshots already written stay in place.
    pub async fn collect(
        &self,
        entities: &BTreeSet<String>,
        as_of: NaiveDate,
        cancel: &CancellationToken,
    ) -> PipelineResult<CollectionRun> {
        let run_id = Uuid::new_v4();
        let started_at = harvest_common::time::now();
        let today = harvest_common::time::today();

        tracing::info!(
            run_id = %run_id,
            as_of = %as_of,
            entities = entities.len(),
            concurrency = self.concurrency,
            "Collection started"
        );

        let results: Vec<EntityResult> = stream::iter(entities.iter().cloned())
            .map(|entity_id| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return EntityResult::Skipped;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => EntityResult::Skipped,
                        result = self.collect_one(&entity_id, as_of, today) => result,
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut entities_attempted = 0;
        let mut entities_succeeded = 0;
        let mut entities_failed = Vec::new();
        for result in results {
            match result {
                EntityResult::Stored => {
                    entities_attempted += 1;
                    entities_succeeded += 1;
                }
                EntityResult::Failed(failure) => {
                    entities_attempted += 1;
                    entities_failed.push(failure);
                }
                EntityResult::Skipped => {}
            }
        }
        entities_failed.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

        let run = CollectionRun {
            run_id,
            run_date: as_of,
            entities_attempted,
            entities_succeeded,
            entities_failed,
            started_at,
            finished_at: harvest_common::time::now(),
        };

        collection_runs::save_run(&self.db, &run).await?;

        tracing::info!(
            run_id = %run.run_id,
            as_of = %as_of,
            attempted = run.entities_attempted,
            succeeded = run.entities_succeeded,
            failed = run.entities_failed.len(),
            not_found = run.failures_of_kind(FetchErrorKind::NotFound),
            unavailable = run.failures_of_kind(FetchErrorKind::Unavailable),
            timeout = run.failures_of_kind(FetchErrorKind::Timeout),
            "Collection finished"
        );

        Ok(run)
    }

    async fn collect_one(&self, entity_id: &str, as_of: NaiveDate, today: NaiveDate) -> EntityResult {
        let fetched = match tokio::time::timeout(
            self.fetch_timeout,
            self.source.fetch_metrics(entity_id, as_of),
        )
        .await
        {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(e)) => return failure(entity_id, e.kind(), e.to_string()),
            Err(_) => {
                return failure(
                    entity_id,
                    FetchErrorKind::Timeout,
                    format!("no response within {:?}", self.fetch_timeout),
                )
            }
        };

        let snapshot = Snapshot {
            entity_id: entity_id.to_string(),
            date: as_of,
            metrics: fetched.metrics,
            readings: fetched.readings,
            collected_at: harvest_common::time::now(),
        };

        match snapshots::upsert_snapshot(&self.db, &snapshot, today).await {
            Ok(()) => {
                tracing::debug!(
                    entity_id = %entity_id,
                    metrics = snapshot.metrics.len(),
                    "Snapshot stored"
                );
                EntityResult::Stored
            }
            Err(e) => failure(entity_id, FetchErrorKind::Storage, e.to_string()),
        }
    }
}

fn failure(entity_id: &str, kind: FetchErrorKind, message: String) -> EntityResult {
    let err = PipelineError::FetchFailed {
        entity_id: entity_id.to_string(),
        kind,
        message: message.clone(),
    };
    tracing::warn!(entity_id = %entity_id, kind = %kind, error = %err, "Entity collection failed");

    EntityResult::Failed(EntityFailure {
        entity_id: entity_id.to_string(),
        kind,
        message,
    })
}

/// Resolve the set of entities a daily run collects
///
/// Union of enabled config entries, the curated `tracked_maps.json` list in
/// the root folder, and every entity already present in the Snapshot Store;
/// entries disabled in the config are removed from the result.
pub async fn resolve_tracked_entities(
    db: &SqlitePool,
    config: &PipelineConfig,
    root_folder: &Path,
) -> PipelineResult<BTreeSet<String>> {
    let mut entities: BTreeSet<String> = config
        .entities
        .iter()
        .filter(|e| e.enabled)
        .map(|e| e.entity_id.clone())
        .collect();

    entities.extend(load_tracked_entities_file(&root_folder.join(TRACKED_ENTITIES_FILE)));
    entities.extend(snapshots::list_entity_ids(db).await?);

    for disabled in config.disabled_entities() {
        entities.remove(&disabled);
    }

    Ok(entities)
}

/// Entities that failed in the latest run for `date` and still lack a snapshot
pub async fn retry_targets(db: &SqlitePool, date: NaiveDate) -> PipelineResult<BTreeSet<String>> {
    let Some(run) = collection_runs::latest_run_for_date(db, date).await? else {
        return Ok(BTreeSet::new());
    };

    let collected = snapshots::entities_collected_on(db, date).await?;

    Ok(run
        .entities_failed
        .into_iter()
        .map(|f| f.entity_id)
        .filter(|id| !collected.contains(id))
        .collect())
}

fn load_tracked_entities_file(path: &Path) -> Vec<String> {
    if !path.exists() {
        return Vec::new();
    }

    let parsed = std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|raw| serde_json::from_str::<TrackedEntitiesFile>(&raw).map_err(|e| e.to_string()));

    match parsed {
        Ok(file) => file
            .maps
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable tracked entity list");
            Vec::new()
        }
    }
}
