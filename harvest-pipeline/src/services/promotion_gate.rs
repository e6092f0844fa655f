//! Promotion Gate
//!
//! The improvement threshold is ABSOLUTE: `candidate - current >= threshold`.
//! With the default 0.01, moving from 0.76 to 0.77 promotes and 0.76 to
//! 0.765 does not. A tie at exactly the threshold promotes.

use serde::{Deserialize, Serialize};

use crate::models::OutcomeReason;

/// Absorbs binary rounding of decimal scores (0.57 - 0.56 is 0.00999...98)
const MARGIN_EPSILON: f64 = 1e-9;

/// Result of comparing a candidate with the deployed model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub promote: bool,
    /// `candidate - current`; `None` when no model is deployed
    pub margin: Option<f64>,
    pub reason: OutcomeReason,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromotionGate {
    threshold: f64,
}

impl PromotionGate {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Decide promote/reject for `candidate_score` against `current_score`
    pub fn decide(&self, candidate_score: f64, current_score: Option<f64>) -> GateDecision {
        // A non-finite candidate cannot be compared; never deploy it
        if !candidate_score.is_finite() {
            return GateDecision {
                promote: false,
                margin: None,
                reason: OutcomeReason::InsufficientImprovement,
            };
        }

        let Some(current_score) = current_score else {
            return GateDecision {
                promote: true,
                margin: None,
                reason: OutcomeReason::Bootstrap,
            };
        };

        let margin = candidate_score - current_score;
        let promote = margin >= self.threshold - MARGIN_EPSILON;

        GateDecision {
            promote,
            margin: Some(margin),
            reason: if promote {
                OutcomeReason::ImprovementMet
            } else {
                OutcomeReason::InsufficientImprovement
            },
        }
    }
}
