//! Repository abstraction for lifecycle interval persistence.
//!
//! This module defines the `LifecycleStore` trait that abstracts storage of
//! state intervals. Implementations provide different backends (in-memory,
//! SQLite). The store is append-and-close only: records are created open,
//! closed exactly once, and never updated or deleted afterwards.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::definition::OpportunityState;
use crate::record::{LifecycleRecord, NewRecord, OpportunityId, RecordId};

/// Errors surfaced by store implementations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Underlying storage failure (I/O, SQL, serialization).
    #[error("storage error during {operation}: {detail}")]
    Storage { operation: String, detail: String },

    /// An open interval already exists for the opportunity. Creating a second
    /// one would violate the one-open-interval invariant.
    #[error("opportunity {opportunity_id} already has an open interval")]
    OpenIntervalExists { opportunity_id: OpportunityId },

    /// No record with the given id exists.
    #[error("record {id} not found")]
    RecordNotFound { id: RecordId },

    /// The record was already closed. Closing twice is a caller bug; the
    /// affected-rows check on the close path surfaces it instead of silently
    /// overwriting the exit timestamp.
    #[error("record {id} is already closed")]
    AlreadyClosed { id: RecordId },
}

impl RepositoryError {
    /// Construct a storage error with operation context.
    pub fn storage(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

/// Receipt for a close operation.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseReceipt {
    pub id: RecordId,
    pub exited_at: DateTime<Utc>,
}

/// Result of an atomic close-then-create advance.
#[derive(Debug, Clone, PartialEq)]
pub struct Advance {
    /// The record that was closed.
    pub closed: LifecycleRecord,
    /// The newly created open record.
    pub opened: LifecycleRecord,
}

/// Filters for snapshot queries over currently-open records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateQuery {
    /// Minimum elapsed seconds in the state.
    pub min_duration: Option<i64>,
    /// Maximum elapsed seconds in the state.
    pub max_duration: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// An open record together with its elapsed time, computed at query time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenInterval {
    pub record: LifecycleRecord,
    pub seconds_in_state: i64,
}

/// Per-state aggregate duration statistics over closed records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateStats {
    pub state: OpportunityState,
    pub closed_count: usize,
    pub mean_seconds: f64,
    pub min_seconds: i64,
    pub max_seconds: i64,
    pub median_seconds: f64,
    pub p95_seconds: f64,
}

/// Frequency of one (from, to) transition pair in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathCount {
    pub from: OpportunityState,
    pub to: OpportunityState,
    pub count: usize,
}

/// Storage backend for lifecycle intervals.
///
/// Invariant: at most one record per opportunity has `exited_at = null` at
/// any instant. Implementations enforce this at the storage level (partial
/// unique index for SQLite, explicit check for the in-memory store) so that
/// a racing writer fails outright rather than corrupting the audit trail.
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    /// Create a new open record. The store assigns `id` and `entered_at`.
    async fn create_state(&self, new: NewRecord) -> Result<LifecycleRecord, RepositoryError>;

    /// Close an open record: set `exited_at` now and the denormalized
    /// `next_state`. Closing a record that is already closed is an error.
    async fn close_state(
        &self,
        id: RecordId,
        next_state: OpportunityState,
    ) -> Result<CloseReceipt, RepositoryError>;

    /// Atomically close `close_id` and create `new` in a single transaction,
    /// so a mid-sequence failure can never leave zero open records.
    async fn advance(
        &self,
        close_id: RecordId,
        new: NewRecord,
    ) -> Result<Advance, RepositoryError>;

    /// The single open record for the opportunity. If more than one is ever
    /// found, the most recently entered wins.
    async fn current_state(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Option<LifecycleRecord>, RepositoryError>;

    /// Full ordered audit trail for an opportunity, oldest first.
    async fn lifecycle_history(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<LifecycleRecord>, RepositoryError>;

    /// Snapshot of currently-open records in `state`, filterable by elapsed
    /// time, computed at query time.
    async fn opportunities_in_state(
        &self,
        state: OpportunityState,
        query: StateQuery,
    ) -> Result<Vec<OpenInterval>, RepositoryError>;

    /// Per-state aggregate duration statistics over closed records only.
    async fn state_analytics(&self) -> Result<Vec<StateStats>, RepositoryError>;

    /// Open records that have been in `from_state` longer than
    /// `hours_in_state`. Polled by an external scheduler to decide when to
    /// fire automatic transitions.
    async fn eligible_for_auto_transition(
        &self,
        from_state: OpportunityState,
        hours_in_state: f64,
    ) -> Result<Vec<LifecycleRecord>, RepositoryError>;

    /// Open records that have been in `from_state` longer than
    /// `days_inactive`. Polled by an external scheduler for dormancy sweeps.
    async fn eligible_for_dormancy(
        &self,
        from_state: OpportunityState,
        days_inactive: f64,
    ) -> Result<Vec<LifecycleRecord>, RepositoryError>;

    /// Most frequent (from, to) transition pairs over the audit log,
    /// descending by count.
    async fn common_paths(&self, limit: usize) -> Result<Vec<PathCount>, RepositoryError>;

    /// Mean seconds from first entry to final close for opportunities whose
    /// journey reached CLOSED. `None` when no journey has completed.
    async fn average_journey_duration(&self) -> Result<Option<f64>, RepositoryError>;
}

/// Compute duration statistics from a list of closed durations (seconds).
///
/// Median and p95 use linear interpolation between order statistics. Shared
/// by both store implementations so their analytics agree exactly.
pub(crate) fn stats_for(state: OpportunityState, mut durations: Vec<i64>) -> Option<StateStats> {
    if durations.is_empty() {
        return None;
    }
    durations.sort_unstable();

    let count = durations.len();
    let sum: i64 = durations.iter().sum();
    let mean = sum as f64 / count as f64;

    Some(StateStats {
        state,
        closed_count: count,
        mean_seconds: mean,
        min_seconds: durations[0],
        max_seconds: durations[count - 1],
        median_seconds: percentile(&durations, 0.50),
        p95_seconds: percentile(&durations, 0.95),
    })
}

/// Linear-interpolation percentile over a sorted slice.
fn percentile(sorted: &[i64], p: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo] as f64
    } else {
        let frac = rank - lo as f64;
        sorted[lo] as f64 * (1.0 - frac) + sorted[hi] as f64 * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_empty_is_none() {
        assert!(stats_for(OpportunityState::Qualified, vec![]).is_none());
    }

    #[test]
    fn test_stats_single_value() {
        let s = stats_for(OpportunityState::Qualified, vec![60]).unwrap();
        assert_eq!(s.closed_count, 1);
        assert_eq!(s.mean_seconds, 60.0);
        assert_eq!(s.min_seconds, 60);
        assert_eq!(s.max_seconds, 60);
        assert_eq!(s.median_seconds, 60.0);
        assert_eq!(s.p95_seconds, 60.0);
    }

    #[test]
    fn test_stats_median_even_count() {
        let s = stats_for(OpportunityState::Outreach, vec![10, 20, 30, 40]).unwrap();
        assert_eq!(s.median_seconds, 25.0);
        assert_eq!(s.mean_seconds, 25.0);
        assert_eq!(s.min_seconds, 10);
        assert_eq!(s.max_seconds, 40);
    }

    #[test]
    fn test_stats_p95_interpolates() {
        let durations: Vec<i64> = (1..=100).collect();
        let s = stats_for(OpportunityState::Engaged, durations).unwrap();
        // rank = 0.95 * 99 = 94.05 -> between 95 and 96.
        assert!((s.p95_seconds - 95.05).abs() < 1e-9);
    }

    #[test]
    fn test_stats_unsorted_input() {
        let s = stats_for(OpportunityState::Dormant, vec![30, 10, 20]).unwrap();
        assert_eq!(s.min_seconds, 10);
        assert_eq!(s.max_seconds, 30);
        assert_eq!(s.median_seconds, 20.0);
    }
}
