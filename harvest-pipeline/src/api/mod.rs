//! HTTP API handlers for harvest-pipeline
//!
//! Read access to the deployed model and the run logs, plus manual rollback.

pub mod health;
pub mod model;
pub mod runs;

pub use health::health_routes;
pub use model::model_routes;
pub use runs::run_routes;
