//! Pure transition validation.
//!
//! The validator is a set of pure functions over the static state catalog.
//! It collects **every** applicable violation rather than short-circuiting on
//! the first, so callers always see the complete picture. No I/O, no side
//! effects, deterministic.

use thiserror::Error;

use crate::definition::{ClosedOutcome, OpportunityState, TriggerType};

/// One reason a proposed transition was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationViolation {
    #[error("unknown from-state: {0}")]
    UnknownFromState(String),

    #[error("unknown to-state: {0}")]
    UnknownToState(String),

    #[error("unknown trigger type: {0}")]
    UnknownTriggerType(String),

    #[error("transition {from} -> {to} is not allowed")]
    EdgeNotAllowed {
        from: OpportunityState,
        to: OpportunityState,
    },

    #[error("unknown sub-state for CLOSED: {0}")]
    UnknownSubState(String),
}

/// The outcome of validating a proposed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub violations: Vec<ValidationViolation>,
}

impl Validation {
    fn ok() -> Self {
        Self { violations: vec![] }
    }

    /// Whether the transition passed every check.
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// The violation reasons as display strings.
    pub fn reasons(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.to_string()).collect()
    }
}

/// Whether the edge `(from, to)` exists in the transition graph.
pub fn check_edge(from: OpportunityState, to: OpportunityState) -> bool {
    from.valid_targets().contains(&to)
}

/// Validate a transition over already-parsed inputs.
///
/// Only the edge and sub-state checks can fail here; the unknown-name checks
/// are unrepresentable once the inputs are typed.
pub fn validate(
    from: OpportunityState,
    to: OpportunityState,
    _trigger: TriggerType,
    sub_state: Option<ClosedOutcome>,
) -> Validation {
    let mut result = Validation::ok();

    if !check_edge(from, to) {
        result
            .violations
            .push(ValidationViolation::EdgeNotAllowed { from, to });
    }

    // A typed ClosedOutcome is always one of the recognized values, so the
    // sub-state check cannot fail on this path. Absence is always valid.
    let _ = sub_state;

    result
}

/// Validate a transition over raw wire names, collecting every violation.
///
/// Checks, in order: from-state recognized, to-state recognized, trigger kind
/// recognized, edge exists (only when both states parsed — no duplicate edge
/// error for unrecognized states), and sub-state recognized when the target
/// is CLOSED and one was supplied.
pub fn validate_raw(
    from: &str,
    to: &str,
    trigger: &str,
    sub_state: Option<&str>,
) -> Validation {
    let mut result = Validation::ok();

    let from_state = OpportunityState::parse(from);
    if from_state.is_none() {
        result
            .violations
            .push(ValidationViolation::UnknownFromState(from.to_string()));
    }

    let to_state = OpportunityState::parse(to);
    if to_state.is_none() {
        result
            .violations
            .push(ValidationViolation::UnknownToState(to.to_string()));
    }

    if TriggerType::parse(trigger).is_none() {
        result
            .violations
            .push(ValidationViolation::UnknownTriggerType(trigger.to_string()));
    }

    if let (Some(from), Some(to)) = (from_state, to_state) {
        if !check_edge(from, to) {
            result
                .violations
                .push(ValidationViolation::EdgeNotAllowed { from, to });
        }
    }

    if to_state == Some(OpportunityState::Closed) {
        if let Some(sub) = sub_state {
            if ClosedOutcome::parse(sub).is_none() {
                result
                    .violations
                    .push(ValidationViolation::UnknownSubState(sub.to_string()));
            }
        }
    }

    result
}
