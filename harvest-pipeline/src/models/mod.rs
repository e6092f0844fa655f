//! Data models for harvest-pipeline

pub mod collection_run;
pub mod model_record;
pub mod retrain;
pub mod snapshot;

pub use collection_run::{CollectionRun, EntityFailure, FetchErrorKind};
pub use model_record::{BackupRecord, CurrentPointer, ModelRecord, TrainingWindow};
pub use retrain::{
    Cadence, OutcomeReason, OutcomeStatus, PipelineState, RetrainDecision, RetrainReason,
    RunOutcome, StateTransition,
};
pub use snapshot::{Metrics, Snapshot, TrackedEntity};
