//! In-memory implementation of `LifecycleStore`.
//!
//! All records are held in memory and lost on restart. Useful for tests and
//! ephemeral deployments; the one-open-interval invariant is enforced with an
//! explicit check under the write lock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    stats_for, Advance, CloseReceipt, LifecycleStore, OpenInterval, PathCount, RepositoryError,
    StateQuery, StateStats,
};
use crate::definition::{OpportunityState, ALL_STATES};
use crate::record::{LifecycleRecord, NewRecord, OpportunityId, RecordId};

struct Inner {
    next_id: i64,
    records: Vec<LifecycleRecord>,
}

/// In-memory lifecycle store.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_id: 1,
                records: Vec::new(),
            }),
        }
    }

    /// Rewrite a record's entry timestamp. Test-only hook for exercising
    /// elapsed-time queries without sleeping.
    #[cfg(test)]
    pub(crate) async fn backdate_entered(
        &self,
        id: RecordId,
        entered_at: chrono::DateTime<Utc>,
    ) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.records.iter_mut().find(|r| r.id == id) {
            record.entered_at = entered_at;
        }
    }

    fn insert_open(inner: &mut Inner, new: NewRecord) -> Result<LifecycleRecord, RepositoryError> {
        let already_open = inner
            .records
            .iter()
            .any(|r| r.opportunity_id == new.opportunity_id && r.is_open());
        if already_open {
            return Err(RepositoryError::OpenIntervalExists {
                opportunity_id: new.opportunity_id,
            });
        }

        let record = LifecycleRecord {
            id: RecordId(inner.next_id),
            opportunity_id: new.opportunity_id,
            state: new.state,
            sub_state: new.sub_state,
            entered_at: Utc::now(),
            exited_at: None,
            trigger_type: new.trigger_type,
            trigger_reason: new.trigger_reason,
            triggered_by: new.triggered_by,
            previous_state: new.previous_state,
            next_state: None,
            metadata: new.metadata,
        };
        inner.next_id += 1;
        inner.records.push(record.clone());
        Ok(record)
    }

    fn close_open(
        inner: &mut Inner,
        id: RecordId,
        next_state: OpportunityState,
    ) -> Result<CloseReceipt, RepositoryError> {
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(RepositoryError::RecordNotFound { id })?;
        if !record.is_open() {
            return Err(RepositoryError::AlreadyClosed { id });
        }
        let exited_at = Utc::now();
        record.exited_at = Some(exited_at);
        record.next_state = Some(next_state);
        Ok(CloseReceipt { id, exited_at })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LifecycleStore for InMemoryStore {
    async fn create_state(&self, new: NewRecord) -> Result<LifecycleRecord, RepositoryError> {
        let mut inner = self.inner.write().await;
        Self::insert_open(&mut inner, new)
    }

    async fn close_state(
        &self,
        id: RecordId,
        next_state: OpportunityState,
    ) -> Result<CloseReceipt, RepositoryError> {
        let mut inner = self.inner.write().await;
        Self::close_open(&mut inner, id, next_state)
    }

    async fn advance(
        &self,
        close_id: RecordId,
        new: NewRecord,
    ) -> Result<Advance, RepositoryError> {
        // One write lock spans both mutations, so the close and create are
        // atomic with respect to every other store operation.
        let mut inner = self.inner.write().await;
        Self::close_open(&mut inner, close_id, new.state)?;
        let opened = match Self::insert_open(&mut inner, new) {
            Ok(opened) => opened,
            Err(e) => {
                // Roll the close back so the store is unchanged on failure.
                if let Some(record) = inner.records.iter_mut().find(|r| r.id == close_id) {
                    record.exited_at = None;
                    record.next_state = None;
                }
                return Err(e);
            }
        };
        let closed = inner
            .records
            .iter()
            .find(|r| r.id == close_id)
            .cloned()
            .ok_or(RepositoryError::RecordNotFound { id: close_id })?;
        Ok(Advance { closed, opened })
    }

    async fn current_state(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Option<LifecycleRecord>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .filter(|r| &r.opportunity_id == opportunity_id && r.is_open())
            .max_by_key(|r| (r.entered_at, r.id.0))
            .cloned())
    }

    async fn lifecycle_history(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<LifecycleRecord>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut history: Vec<LifecycleRecord> = inner
            .records
            .iter()
            .filter(|r| &r.opportunity_id == opportunity_id)
            .cloned()
            .collect();
        history.sort_by_key(|r| (r.entered_at, r.id.0));
        Ok(history)
    }

    async fn opportunities_in_state(
        &self,
        state: OpportunityState,
        query: StateQuery,
    ) -> Result<Vec<OpenInterval>, RepositoryError> {
        let now = Utc::now();
        let inner = self.inner.read().await;

        let mut intervals: Vec<OpenInterval> = inner
            .records
            .iter()
            .filter(|r| r.state == state && r.is_open())
            .map(|r| OpenInterval {
                seconds_in_state: (now - r.entered_at).num_seconds(),
                record: r.clone(),
            })
            .filter(|i| query.min_duration.is_none_or(|min| i.seconds_in_state >= min))
            .filter(|i| query.max_duration.is_none_or(|max| i.seconds_in_state <= max))
            .collect();

        // Longest-waiting first.
        intervals.sort_by_key(|i| (i.record.entered_at, i.record.id.0));
        let offset = query.offset.unwrap_or(0);
        let limited: Vec<OpenInterval> = intervals
            .into_iter()
            .skip(offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(limited)
    }

    async fn state_analytics(&self) -> Result<Vec<StateStats>, RepositoryError> {
        let inner = self.inner.read().await;

        let mut by_state: HashMap<OpportunityState, Vec<i64>> = HashMap::new();
        for record in &inner.records {
            if let Some(duration) = record.duration_seconds() {
                by_state.entry(record.state).or_default().push(duration);
            }
        }

        Ok(ALL_STATES
            .iter()
            .filter_map(|&state| stats_for(state, by_state.remove(&state).unwrap_or_default()))
            .collect())
    }

    async fn eligible_for_auto_transition(
        &self,
        from_state: OpportunityState,
        hours_in_state: f64,
    ) -> Result<Vec<LifecycleRecord>, RepositoryError> {
        self.open_older_than(from_state, hours_in_state * 3600.0).await
    }

    async fn eligible_for_dormancy(
        &self,
        from_state: OpportunityState,
        days_inactive: f64,
    ) -> Result<Vec<LifecycleRecord>, RepositoryError> {
        self.open_older_than(from_state, days_inactive * 86_400.0).await
    }

    async fn common_paths(&self, limit: usize) -> Result<Vec<PathCount>, RepositoryError> {
        let inner = self.inner.read().await;

        let mut counts: HashMap<(OpportunityState, OpportunityState), usize> = HashMap::new();
        for record in &inner.records {
            if let Some(next) = record.next_state {
                *counts.entry((record.state, next)).or_insert(0) += 1;
            }
        }

        let mut paths: Vec<PathCount> = counts
            .into_iter()
            .map(|((from, to), count)| PathCount { from, to, count })
            .collect();
        paths.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.from.as_str().cmp(b.from.as_str()))
                .then_with(|| a.to.as_str().cmp(b.to.as_str()))
        });
        paths.truncate(limit);
        Ok(paths)
    }

    async fn average_journey_duration(&self) -> Result<Option<f64>, RepositoryError> {
        let inner = self.inner.read().await;

        // first entry and time of reaching CLOSED, per opportunity
        let mut journeys: HashMap<&OpportunityId, (chrono::DateTime<Utc>, Option<chrono::DateTime<Utc>>)> =
            HashMap::new();
        for record in &inner.records {
            let entry = journeys
                .entry(&record.opportunity_id)
                .or_insert((record.entered_at, None));
            if record.entered_at < entry.0 {
                entry.0 = record.entered_at;
            }
            if record.state == OpportunityState::Closed {
                let reached = entry.1.get_or_insert(record.entered_at);
                if record.entered_at > *reached {
                    *reached = record.entered_at;
                }
            }
        }

        let durations: Vec<i64> = journeys
            .values()
            .filter_map(|(first, closed)| closed.map(|c| (c - *first).num_seconds()))
            .collect();
        if durations.is_empty() {
            return Ok(None);
        }
        let sum: i64 = durations.iter().sum();
        Ok(Some(sum as f64 / durations.len() as f64))
    }
}

impl InMemoryStore {
    async fn open_older_than(
        &self,
        state: OpportunityState,
        threshold_seconds: f64,
    ) -> Result<Vec<LifecycleRecord>, RepositoryError> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        let mut eligible: Vec<LifecycleRecord> = inner
            .records
            .iter()
            .filter(|r| r.state == state && r.is_open())
            .filter(|r| (now - r.entered_at).num_seconds() as f64 > threshold_seconds)
            .cloned()
            .collect();
        eligible.sort_by_key(|r| (r.entered_at, r.id.0));
        Ok(eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::TriggerType;
    use chrono::Duration;

    fn new_record(opp: &str, state: OpportunityState) -> NewRecord {
        NewRecord {
            opportunity_id: OpportunityId::from(opp),
            state,
            sub_state: None,
            trigger_type: TriggerType::Manual,
            trigger_reason: "test".to_string(),
            triggered_by: None,
            previous_state: None,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_entered_at() {
        let store = InMemoryStore::new();
        let record = store
            .create_state(new_record("opp-1", OpportunityState::Discovered))
            .await
            .unwrap();
        assert_eq!(record.id, RecordId(1));
        assert!(record.is_open());
    }

    #[tokio::test]
    async fn test_second_open_record_rejected() {
        let store = InMemoryStore::new();
        store
            .create_state(new_record("opp-1", OpportunityState::Discovered))
            .await
            .unwrap();
        let err = store
            .create_state(new_record("opp-1", OpportunityState::Qualified))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::OpenIntervalExists { .. }));
    }

    #[tokio::test]
    async fn test_close_sets_exit_and_next_state() {
        let store = InMemoryStore::new();
        let record = store
            .create_state(new_record("opp-1", OpportunityState::Discovered))
            .await
            .unwrap();
        store
            .close_state(record.id, OpportunityState::Qualified)
            .await
            .unwrap();

        let history = store
            .lifecycle_history(&OpportunityId::from("opp-1"))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].is_open());
        assert_eq!(history[0].next_state, Some(OpportunityState::Qualified));
    }

    #[tokio::test]
    async fn test_double_close_is_an_error() {
        let store = InMemoryStore::new();
        let record = store
            .create_state(new_record("opp-1", OpportunityState::Discovered))
            .await
            .unwrap();
        store
            .close_state(record.id, OpportunityState::Qualified)
            .await
            .unwrap();
        let err = store
            .close_state(record.id, OpportunityState::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::AlreadyClosed { .. }));
    }

    #[tokio::test]
    async fn test_advance_closes_and_opens() {
        let store = InMemoryStore::new();
        let first = store
            .create_state(new_record("opp-1", OpportunityState::Discovered))
            .await
            .unwrap();
        let advance = store
            .advance(first.id, new_record("opp-1", OpportunityState::Qualified))
            .await
            .unwrap();

        assert_eq!(advance.closed.id, first.id);
        assert_eq!(advance.closed.next_state, Some(OpportunityState::Qualified));
        assert!(advance.opened.is_open());
        assert_eq!(advance.opened.state, OpportunityState::Qualified);

        let current = store
            .current_state(&OpportunityId::from("opp-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.id, advance.opened.id);
    }

    #[tokio::test]
    async fn test_advance_unknown_record() {
        let store = InMemoryStore::new();
        let err = store
            .advance(RecordId(42), new_record("opp-1", OpportunityState::Qualified))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn test_current_state_none_when_all_closed() {
        let store = InMemoryStore::new();
        let record = store
            .create_state(new_record("opp-1", OpportunityState::Discovered))
            .await
            .unwrap();
        store
            .close_state(record.id, OpportunityState::Closed)
            .await
            .unwrap();
        let current = store
            .current_state(&OpportunityId::from("opp-1"))
            .await
            .unwrap();
        assert!(current.is_none());
    }

    #[tokio::test]
    async fn test_opportunities_in_state_duration_filters() {
        let store = InMemoryStore::new();
        let fresh = store
            .create_state(new_record("opp-fresh", OpportunityState::Qualified))
            .await
            .unwrap();
        let stale = store
            .create_state(new_record("opp-stale", OpportunityState::Qualified))
            .await
            .unwrap();
        let _ = fresh;
        store
            .backdate_entered(stale.id, Utc::now() - Duration::hours(3))
            .await;

        let old_only = store
            .opportunities_in_state(
                OpportunityState::Qualified,
                StateQuery {
                    min_duration: Some(2 * 3600),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(old_only.len(), 1);
        assert_eq!(old_only[0].record.opportunity_id, OpportunityId::from("opp-stale"));
        assert!(old_only[0].seconds_in_state >= 2 * 3600);

        let all = store
            .opportunities_in_state(OpportunityState::Qualified, StateQuery::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        // Longest-waiting first.
        assert_eq!(all[0].record.opportunity_id, OpportunityId::from("opp-stale"));
    }

    #[tokio::test]
    async fn test_eligibility_thresholds() {
        let store = InMemoryStore::new();
        let record = store
            .create_state(new_record("opp-1", OpportunityState::Qualified))
            .await
            .unwrap();
        store
            .backdate_entered(record.id, Utc::now() - Duration::hours(3))
            .await;

        let eligible = store
            .eligible_for_auto_transition(OpportunityState::Qualified, 2.0)
            .await
            .unwrap();
        assert_eq!(eligible.len(), 1);

        let not_yet = store
            .eligible_for_auto_transition(OpportunityState::Qualified, 4.0)
            .await
            .unwrap();
        assert!(not_yet.is_empty());

        let dormancy = store
            .eligible_for_dormancy(OpportunityState::Qualified, 30.0)
            .await
            .unwrap();
        assert!(dormancy.is_empty());
    }

    #[tokio::test]
    async fn test_common_paths_counts_closed_pairs() {
        let store = InMemoryStore::new();
        for opp in ["a", "b", "c"] {
            let first = store
                .create_state(new_record(opp, OpportunityState::Discovered))
                .await
                .unwrap();
            store
                .advance(first.id, new_record(opp, OpportunityState::Qualified))
                .await
                .unwrap();
        }

        let paths = store.common_paths(10).await.unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(
            paths[0],
            PathCount {
                from: OpportunityState::Discovered,
                to: OpportunityState::Qualified,
                count: 3,
            }
        );
    }

    #[tokio::test]
    async fn test_average_journey_duration_requires_closed() {
        let store = InMemoryStore::new();
        store
            .create_state(new_record("opp-1", OpportunityState::Discovered))
            .await
            .unwrap();
        assert_eq!(store.average_journey_duration().await.unwrap(), None);

        let current = store
            .current_state(&OpportunityId::from("opp-1"))
            .await
            .unwrap()
            .unwrap();
        store
            .advance(current.id, new_record("opp-1", OpportunityState::Closed))
            .await
            .unwrap();
        let avg = store.average_journey_duration().await.unwrap();
        assert!(avg.is_some());
        assert!(avg.unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_analytics_only_closed_records() {
        let store = InMemoryStore::new();
        let first = store
            .create_state(new_record("opp-1", OpportunityState::Discovered))
            .await
            .unwrap();
        store
            .advance(first.id, new_record("opp-1", OpportunityState::Qualified))
            .await
            .unwrap();

        let stats = store.state_analytics().await.unwrap();
        // Only DISCOVERED has a closed interval; the open QUALIFIED record
        // must not appear.
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].state, OpportunityState::Discovered);
        assert_eq!(stats[0].closed_count, 1);
    }
}
