//! Pipeline services
//!
//! Collector, Coverage Evaluator, Promotion Gate and the adapters for the
//! two external collaborators (metrics source and trainer).

pub mod collector;
pub mod coverage;
pub mod metrics_client;
pub mod promotion_gate;
pub mod trainer;

pub use collector::{resolve_tracked_entities, retry_targets, Collector};
pub use coverage::CoverageEvaluator;
pub use metrics_client::{FetchError, FetchedMetrics, FncreateClient, MetricsSource};
pub use promotion_gate::{GateDecision, PromotionGate};
pub use trainer::{CommandTrainer, Trainer, TrainingOutput};
