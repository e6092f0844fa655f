//! Pipeline run state machine
//!
//! Daily:  IDLE → COLLECTING → IDLE
//! Weekly: IDLE → EVALUATING → SKIPPED
//!                           → TRAINING → VALIDATING → PROMOTED | REJECTED
//!
//! Training failure jumps from TRAINING straight to REJECTED.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineState {
    /// Entry point for both cadences, and terminal after a run
    Idle,
    /// Collector running
    Collecting,
    /// Coverage Evaluator deciding whether to train
    Evaluating,
    /// Not enough new data; nothing else happens
    Skipped,
    /// External trainer producing a candidate
    Training,
    /// Promotion Gate comparing candidate and current
    Validating,
    /// Candidate swapped in
    Promoted,
    /// Candidate discarded
    Rejected,
    /// Unrecovered error outside the gate decision
    Failed,
}

impl PipelineState {
    /// States after which the run produces its outcome record
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Skipped
                | PipelineState::Promoted
                | PipelineState::Rejected
                | PipelineState::Failed
        )
    }
}

/// Which scheduled entry point started the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Daily,
    Weekly,
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Daily => f.write_str("daily"),
            Cadence::Weekly => f.write_str("weekly"),
        }
    }
}

/// Why the Coverage Evaluator did or did not trigger training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainReason {
    InsufficientNewData,
    Forced,
    ScheduledThresholdMet,
}

/// Transient result of EVALUATING; only kept in the run's outcome record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrainDecision {
    pub triggered: bool,
    pub reason: RetrainReason,
    pub new_day_count: usize,
}

impl RetrainDecision {
    /// Apply the minimum-new-days rule; `force` always triggers
    pub fn evaluate(new_day_count: usize, min_new_days: usize, force: bool) -> Self {
        if new_day_count >= min_new_days {
            Self {
                triggered: true,
                reason: RetrainReason::ScheduledThresholdMet,
                new_day_count,
            }
        } else if force {
            Self {
                triggered: true,
                reason: RetrainReason::Forced,
                new_day_count,
            }
        } else {
            Self {
                triggered: false,
                reason: RetrainReason::InsufficientNewData,
                new_day_count,
            }
        }
    }
}

/// Final classification of a weekly run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeStatus {
    Skipped,
    Promoted,
    Rejected,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Skipped => "SKIPPED",
            OutcomeStatus::Promoted => "PROMOTED",
            OutcomeStatus::Rejected => "REJECTED",
            OutcomeStatus::Failed => "FAILED",
        }
    }

    /// Outcomes that map to a zero exit code
    pub fn is_clean(&self) -> bool {
        !matches!(self, OutcomeStatus::Failed)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rationale attached to the outcome record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeReason {
    InsufficientNewData,
    /// No model deployed yet; first candidate promotes
    Bootstrap,
    ImprovementMet,
    InsufficientImprovement,
    TrainingFailed,
    Cancelled,
    Error,
}

/// State transition event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub old_state: PipelineState,
    pub new_state: PipelineState,
    pub transitioned_at: DateTime<Utc>,
}

/// Structured outcome record of one weekly run
///
/// Holds everything needed to reconstruct why a promotion did or did not
/// happen: new-day count, both scores, the margin and the threshold used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub cadence: Cadence,
    pub state: PipelineState,
    pub status: Option<OutcomeStatus>,
    pub reason: Option<OutcomeReason>,
    pub detail: Option<String>,
    pub dry_run: bool,
    pub forced: bool,
    pub decision: Option<RetrainDecision>,
    pub total_day_count: Option<usize>,
    pub current_version: Option<u64>,
    pub current_score: Option<f64>,
    pub candidate_score: Option<f64>,
    pub margin: Option<f64>,
    pub threshold: f64,
    pub promoted_version: Option<u64>,
    pub backup_id: Option<String>,
    pub transitions: Vec<StateTransition>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunOutcome {
    /// Create a new run record in IDLE
    pub fn new(cadence: Cadence, threshold: f64, dry_run: bool, forced: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cadence,
            state: PipelineState::Idle,
            status: None,
            reason: None,
            detail: None,
            dry_run,
            forced,
            decision: None,
            total_day_count: None,
            current_version: None,
            current_score: None,
            candidate_score: None,
            margin: None,
            threshold,
            promoted_version: None,
            backup_id: None,
            transitions: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Transition to new state
    pub fn transition_to(&mut self, new_state: PipelineState) -> StateTransition {
        let transition = StateTransition {
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        self.state = new_state;
        self.transitions.push(transition.clone());

        tracing::debug!(
            run_id = %self.run_id,
            from = ?transition.old_state,
            to = ?transition.new_state,
            "State transition"
        );

        transition
    }

    /// Record the terminal classification and stamp the end time
    pub fn finish(&mut self, status: OutcomeStatus, reason: OutcomeReason, detail: Option<String>) {
        self.status = Some(status);
        self.reason = Some(reason);
        self.detail = detail;
        self.finished_at = Some(Utc::now());
    }

    /// Check if the run produced its outcome
    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_below_minimum_skips() {
        let d = RetrainDecision::evaluate(6, 7, false);
        assert!(!d.triggered);
        assert_eq!(d.reason, RetrainReason::InsufficientNewData);
        assert_eq!(d.new_day_count, 6);
    }

    #[test]
    fn test_decision_at_minimum_triggers() {
        let d = RetrainDecision::evaluate(7, 7, false);
        assert!(d.triggered);
        assert_eq!(d.reason, RetrainReason::ScheduledThresholdMet);
    }

    #[test]
    fn test_decision_forced() {
        let d = RetrainDecision::evaluate(0, 7, true);
        assert!(d.triggered);
        assert_eq!(d.reason, RetrainReason::Forced);

        // Enough data reports the scheduled reason even when forced
        let d = RetrainDecision::evaluate(9, 7, true);
        assert_eq!(d.reason, RetrainReason::ScheduledThresholdMet);
    }

    #[test]
    fn test_transitions_are_recorded() {
        let mut outcome = RunOutcome::new(Cadence::Weekly, 0.01, false, false);
        outcome.transition_to(PipelineState::Evaluating);
        outcome.transition_to(PipelineState::Skipped);

        assert_eq!(outcome.state, PipelineState::Skipped);
        assert!(outcome.state.is_terminal());
        assert_eq!(outcome.transitions.len(), 2);
        assert_eq!(outcome.transitions[0].old_state, PipelineState::Idle);
        assert_eq!(outcome.transitions[1].new_state, PipelineState::Skipped);
    }

    #[test]
    fn test_outcome_serializes_uppercase_status() {
        let mut outcome = RunOutcome::new(Cadence::Weekly, 0.01, true, false);
        outcome.finish(OutcomeStatus::Rejected, OutcomeReason::InsufficientImprovement, None);

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "REJECTED");
        assert_eq!(json["reason"], "insufficient_improvement");
        assert_eq!(json["cadence"], "weekly");
        assert_eq!(json["dry_run"], true);
        assert!(outcome.is_finished());
        assert!(OutcomeStatus::Rejected.is_clean());
        assert!(!OutcomeStatus::Failed.is_clean());
    }
}
