//! Database access for harvest-pipeline
//!
//! Snapshot Store, CollectionRun log and retrain outcome log, all in the
//! shared SQLite database under the root folder.

pub mod collection_runs;
pub mod retrain_runs;
pub mod snapshots;

use harvest_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
///
/// Creates the database and schema on first run.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    tracing::debug!("Connecting to database: {}", db_path.display());
    harvest_common::db::init_database(db_path).await
}
