//! Cadence orchestration

pub mod orchestrator;

pub use orchestrator::{DailyOptions, Orchestrator, WeeklyOptions};
