//! Test Helper Utilities
//!
//! Scripted collaborators and store seeding shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use chrono::{Duration as ChronoDuration, NaiveDate};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use harvest_common::db::init_memory_database;
use harvest_pipeline::config::PipelineConfig;
use harvest_pipeline::db::snapshots;
use harvest_pipeline::models::{Snapshot, TrainingWindow};
use harvest_pipeline::services::{FetchError, FetchedMetrics, MetricsSource, Trainer, TrainingOutput};
use harvest_pipeline::store::ArtifactStore;
use harvest_pipeline::workflow::Orchestrator;
use harvest_pipeline::{build_router, AppState, PipelineError, PipelineResult};

/// Metrics source answering from a script instead of the network
#[derive(Default)]
pub struct StubSource {
    failures: Mutex<HashMap<String, FetchError>>,
    hanging: Mutex<HashSet<String>>,
    value: Mutex<f64>,
    calls: AtomicUsize,
}

impl StubSource {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(42.0),
            ..Default::default()
        }
    }

    pub fn fail(&self, entity_id: &str, error: FetchError) {
        self.failures
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), error);
    }

    /// Never answer for `entity_id`
    pub fn hang(&self, entity_id: &str) {
        self.hanging.lock().unwrap().insert(entity_id.to_string());
    }

    pub fn heal(&self) {
        self.failures.lock().unwrap().clear();
        self.hanging.lock().unwrap().clear();
    }

    /// Value reported as `avg_ccu` from now on
    pub fn set_value(&self, value: f64) {
        *self.value.lock().unwrap() = value;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsSource for StubSource {
    async fn fetch_metrics(
        &self,
        entity_id: &str,
        _as_of: NaiveDate,
    ) -> Result<FetchedMetrics, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let hangs = self.hanging.lock().unwrap().contains(entity_id);
        if hangs {
            std::future::pending::<()>().await;
        }
        let failure = self.failures.lock().unwrap().get(entity_id).cloned();
        if let Some(err) = failure {
            return Err(err);
        }

        let value = *self.value.lock().unwrap();
        Ok(FetchedMetrics {
            metrics: BTreeMap::from([("avg_ccu".to_string(), value)]),
            readings: vec![value - 2.0, value + 2.0],
        })
    }
}

/// Trainer returning scripted scores in order
#[derive(Default)]
pub struct StubTrainer {
    script: Mutex<VecDeque<Result<f64, String>>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_snapshot_count: AtomicUsize,
    last_window: Mutex<Option<TrainingWindow>>,
}

impl StubTrainer {
    pub fn scripted(results: Vec<Result<f64, String>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            ..Default::default()
        }
    }

    pub fn scores(scores: &[f64]) -> Self {
        Self::scripted(scores.iter().copied().map(Ok).collect())
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_snapshot_count(&self) -> usize {
        self.last_snapshot_count.load(Ordering::SeqCst)
    }

    pub fn last_window(&self) -> Option<TrainingWindow> {
        self.last_window.lock().unwrap().clone()
    }
}

#[async_trait]
impl Trainer for StubTrainer {
    async fn train(
        &self,
        snapshots: &[Snapshot],
        window: &TrainingWindow,
    ) -> PipelineResult<TrainingOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_snapshot_count
            .store(snapshots.len(), Ordering::SeqCst);
        *self.last_window.lock().unwrap() = Some(window.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(score)) => Ok(TrainingOutput {
                artifact: format!("model scored {}", score).into_bytes(),
                quality_score: score,
                metrics: BTreeMap::from([("mae".to_string(), 1.5)]),
            }),
            Some(Err(message)) => Err(PipelineError::TrainingFailed(message)),
            None => Err(PipelineError::TrainingFailed("no scripted result".to_string())),
        }
    }
}

/// Orchestrator wired to stubs, an in-memory database and a temp store
pub struct Harness {
    pub dir: TempDir,
    pub db: SqlitePool,
    pub source: Arc<StubSource>,
    pub trainer: Arc<StubTrainer>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub async fn new(trainer: StubTrainer) -> Self {
        Self::with_config(trainer, test_config()).await
    }

    pub async fn with_config(trainer: StubTrainer, config: PipelineConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let db = init_memory_database().await.unwrap();
        let store = ArtifactStore::open(dir.path().join("models")).unwrap();
        let source = Arc::new(StubSource::new());
        let trainer = Arc::new(trainer);

        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            config,
            dir.path().to_path_buf(),
            store,
            source.clone(),
            trainer.clone(),
        ));

        Self {
            dir,
            db,
            source,
            trainer,
            orchestrator,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        self.orchestrator.store()
    }

    /// HTTP router over the same state
    pub fn app(&self) -> Router {
        build_router(AppState::new(self.db.clone(), self.orchestrator.clone()))
    }
}

/// Defaults with a training floor small enough for seeded stores
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        min_training_snapshots: 1,
        fetch_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn today() -> NaiveDate {
    harvest_common::time::today()
}

pub fn days_ago(days: i64) -> NaiveDate {
    today() - ChronoDuration::days(days)
}

pub fn entity_ids(count: usize) -> BTreeSet<String> {
    (0..count).map(|i| format!("map-{:02}", i)).collect()
}

/// Seed `days` distinct days ending today, one snapshot per entity per day
pub async fn seed_days(pool: &SqlitePool, days: i64, entities: &[&str]) {
    for offset in 0..days {
        for entity_id in entities {
            seed_snapshot(pool, entity_id, days_ago(offset)).await;
        }
    }
}

pub async fn seed_snapshot(pool: &SqlitePool, entity_id: &str, date: NaiveDate) {
    let snapshot = Snapshot {
        entity_id: entity_id.to_string(),
        date,
        metrics: BTreeMap::from([("avg_ccu".to_string(), 10.0)]),
        readings: vec![8.0, 12.0],
        collected_at: harvest_common::time::now(),
    };
    snapshots::upsert_snapshot(pool, &snapshot, today())
        .await
        .unwrap();
}
