//! Artifact Store and its promotion lease

pub mod artifact_store;
pub mod lease;

pub use artifact_store::{ArtifactStore, CandidateModel, SwapResult};
pub use lease::{LeaseGuard, LeaseInfo, PromotionLease};
