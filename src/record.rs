//! Persisted lifecycle record types.
//!
//! A `LifecycleRecord` is one immutable row representing the span of time an
//! opportunity spent in a given state. Records are created open and closed
//! exactly once; they are never updated or deleted after that (the store is
//! append-and-close only).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::definition::{ClosedOutcome, OpportunityState, TriggerType};

/// Newtype for the external opportunity identifier. Opaque to this core;
/// the opportunity itself is owned by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpportunityId(pub String);

impl OpportunityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpportunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for OpportunityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OpportunityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype for the store-assigned record identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// One time-bounded state interval for an opportunity.
///
/// `exited_at` is null while this is the opportunity's current state and is
/// set exactly once at close, together with the denormalized `next_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub id: RecordId,
    pub opportunity_id: OpportunityId,
    pub state: OpportunityState,
    /// Meaningful only when `state` is `Closed`.
    pub sub_state: Option<ClosedOutcome>,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub trigger_type: TriggerType,
    pub trigger_reason: String,
    pub triggered_by: Option<String>,
    /// Denormalized copy of the prior state at creation time.
    pub previous_state: Option<OpportunityState>,
    /// Written at close time; equals the state of the record that closed this one.
    pub next_state: Option<OpportunityState>,
    /// Opaque payload, passed through unexamined.
    pub metadata: serde_json::Value,
}

impl LifecycleRecord {
    /// Seconds spent in this state, once closed.
    pub fn duration_seconds(&self) -> Option<i64> {
        self.exited_at
            .map(|exited| (exited - self.entered_at).num_seconds())
    }

    /// Whether this is the opportunity's current (open) interval.
    pub fn is_open(&self) -> bool {
        self.exited_at.is_none()
    }
}

/// Payload for creating a new open record. The store assigns `id` and
/// `entered_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub opportunity_id: OpportunityId,
    pub state: OpportunityState,
    pub sub_state: Option<ClosedOutcome>,
    pub trigger_type: TriggerType,
    pub trigger_reason: String,
    pub triggered_by: Option<String>,
    pub previous_state: Option<OpportunityState>,
    pub metadata: serde_json::Value,
}

/// Query-surface projection of a record for timing analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTiming {
    pub state: OpportunityState,
    pub sub_state: Option<ClosedOutcome>,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub trigger_type: TriggerType,
}

impl From<&LifecycleRecord> for StateTiming {
    fn from(record: &LifecycleRecord) -> Self {
        Self {
            state: record.state,
            sub_state: record.sub_state,
            entered_at: record.entered_at,
            exited_at: record.exited_at,
            duration_seconds: record.duration_seconds(),
            trigger_type: record.trigger_type,
        }
    }
}
