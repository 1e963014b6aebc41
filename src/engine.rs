//! Lifecycle engine: orchestrates transitions end-to-end.
//!
//! A transition resolves the opportunity's current state, validates the
//! requested edge, persists the close-then-open pair atomically, updates an
//! in-process introspection ring, and emits the event sequence. Concurrent
//! transitions for the same opportunity are serialized with a per-key async
//! lock; the storage-level unique index is the backstop if that lock is ever
//! bypassed. Transitions for different opportunities do not contend.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::definition::{
    self, ClosedOutcome, OpportunityState, StateGraph, TriggerType,
};
use crate::event::{AutoActionPayload, EventBus, LifecycleEvent, TransitionPayload};
use crate::record::{
    LifecycleRecord, NewRecord, OpportunityId, RecordId, StateTiming,
};
use crate::repository::{
    LifecycleStore, OpenInterval, PathCount, RepositoryError, StateQuery, StateStats,
};
use crate::validator::{self, Validation, ValidationViolation};

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested transition failed validation. Carries the complete set
    /// of violations; nothing was persisted.
    #[error("invalid transition: {}", format_violations(.violations))]
    InvalidTransition { violations: Vec<ValidationViolation> },

    /// No open record and no explicit initialization. Only returned when the
    /// implicit-bootstrap compatibility flag is off.
    #[error("opportunity {id} has no lifecycle record; call initialize() first")]
    UnknownOpportunity { id: OpportunityId },

    /// `initialize()` was called for an opportunity that already has an open
    /// record.
    #[error("opportunity {id} is already initialized")]
    AlreadyInitialized { id: OpportunityId },

    /// Persistence failure, propagated unmodified. No automatic retry.
    #[error(transparent)]
    Storage(#[from] RepositoryError),

    /// The persistence portion of the call exceeded the configured bound.
    #[error("transition timed out after {timeout:?}")]
    Timeout { timeout: Duration },
}

fn format_violations(violations: &[ValidationViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Options for `transition()`.
#[derive(Debug, Clone)]
pub struct TransitionOptions {
    pub trigger_type: TriggerType,
    pub trigger_reason: String,
    pub triggered_by: Option<String>,
    /// Closed outcome; meaningful only when the target state is CLOSED.
    pub sub_state: Option<ClosedOutcome>,
    /// Opaque payload attached to the new interval, passed through
    /// unexamined.
    pub metadata: serde_json::Value,
}

impl Default for TransitionOptions {
    fn default() -> Self {
        Self {
            trigger_type: TriggerType::Manual,
            trigger_reason: String::new(),
            triggered_by: None,
            sub_state: None,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// Options for `initialize()`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub trigger_type: TriggerType,
    pub trigger_reason: String,
    pub triggered_by: Option<String>,
    pub metadata: serde_json::Value,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            trigger_type: TriggerType::Manual,
            trigger_reason: String::new(),
            triggered_by: None,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

/// Receipt returned by successful mutations.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionReceipt {
    /// Id of the newly opened record.
    pub state_id: RecordId,
    /// State the opportunity left. `None` for `initialize()`.
    pub from: Option<OpportunityState>,
    pub to: OpportunityState,
    pub sub_state: Option<ClosedOutcome>,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Opportunity lifecycle engine over a storage backend.
pub struct LifecycleEngine<S: LifecycleStore> {
    store: Arc<S>,
    config: EngineConfig,
    bus: EventBus,
    /// Per-opportunity serialization locks. Entries are created on first use
    /// and evicted after a terminal transition once uncontended, so the map
    /// is bounded by the number of non-closed opportunities this process has
    /// touched.
    locks: Mutex<HashMap<OpportunityId, Arc<Mutex<()>>>>,
    /// Bounded, non-authoritative ring of recent transitions for
    /// introspection. Lost on restart; the store is the source of truth.
    history: RwLock<VecDeque<TransitionPayload>>,
}

impl<S: LifecycleStore> LifecycleEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self {
            store: Arc::new(store),
            config,
            bus: EventBus::new(),
            locks: Mutex::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// Subscribe to lifecycle events. Delivery is fire-and-forget: a slow or
    /// failing subscriber cannot fail or delay a transition.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.bus.subscribe()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Explicitly create the opportunity's entry record in DISCOVERED.
    ///
    /// Emits `Entered(DISCOVERED)` and the DISCOVERED auto-actions.
    pub async fn initialize(
        &self,
        opportunity_id: &OpportunityId,
        options: InitOptions,
    ) -> Result<TransitionReceipt, EngineError> {
        let _guard = self.lock_for(opportunity_id).await;

        if self.store.current_state(opportunity_id).await?.is_some() {
            return Err(EngineError::AlreadyInitialized {
                id: opportunity_id.clone(),
            });
        }

        let new = NewRecord {
            opportunity_id: opportunity_id.clone(),
            state: OpportunityState::Discovered,
            sub_state: None,
            trigger_type: options.trigger_type,
            trigger_reason: options.trigger_reason,
            triggered_by: options.triggered_by,
            previous_state: None,
            metadata: options.metadata,
        };
        let record = self.persist_bounded(None, new).await?;
        let timestamp = record.entered_at;

        info!(
            opportunity = %opportunity_id,
            state_id = %record.id,
            "initialized in DISCOVERED"
        );

        self.bus.publish(LifecycleEvent::Entered {
            state: OpportunityState::Discovered,
            opportunity_id: opportunity_id.clone(),
            timestamp,
        });
        self.emit_auto_actions(
            OpportunityState::Discovered,
            opportunity_id,
            &record.metadata,
            timestamp,
        );

        Ok(TransitionReceipt {
            state_id: record.id,
            from: None,
            to: OpportunityState::Discovered,
            sub_state: None,
            timestamp,
        })
    }

    /// Advance the opportunity to `to`. The sole mutation entry point for
    /// stage changes.
    ///
    /// On success the previous interval (if any) is closed and a new open
    /// interval is created in one atomic store operation, then the event
    /// sequence is emitted: `Transition`, `Entered(to)`, `Exited(from)` only
    /// when a prior record existed, and one `AutoAction` per action
    /// configured for `to`.
    pub async fn transition(
        &self,
        opportunity_id: &OpportunityId,
        to: OpportunityState,
        options: TransitionOptions,
    ) -> Result<TransitionReceipt, EngineError> {
        let guard = self.lock_for(opportunity_id).await;

        let current = self.store.current_state(opportunity_id).await?;
        let (from, close_id) = match &current {
            Some(record) => (record.state, Some(record.id)),
            None if self.config.implicit_bootstrap => (OpportunityState::Discovered, None),
            None => {
                return Err(EngineError::UnknownOpportunity {
                    id: opportunity_id.clone(),
                })
            }
        };

        let validation: Validation =
            validator::validate(from, to, options.trigger_type, options.sub_state);
        if !validation.is_valid() {
            warn!(
                opportunity = %opportunity_id,
                from = %from,
                to = %to,
                reasons = ?validation.reasons(),
                "transition rejected"
            );
            return Err(EngineError::InvalidTransition {
                violations: validation.violations,
            });
        }

        // A sub-state only means something on CLOSED intervals.
        let sub_state = if to == OpportunityState::Closed {
            options.sub_state
        } else {
            if options.sub_state.is_some() {
                warn!(
                    opportunity = %opportunity_id,
                    to = %to,
                    "sub-state ignored for non-CLOSED target"
                );
            }
            None
        };

        let new = NewRecord {
            opportunity_id: opportunity_id.clone(),
            state: to,
            sub_state,
            trigger_type: options.trigger_type,
            trigger_reason: options.trigger_reason.clone(),
            triggered_by: options.triggered_by.clone(),
            previous_state: Some(from),
            metadata: options.metadata,
        };
        let record = self.persist_bounded(close_id, new).await?;
        let timestamp = record.entered_at;

        info!(
            opportunity = %opportunity_id,
            from = %from,
            to = %to,
            state_id = %record.id,
            trigger = %options.trigger_type,
            "transition committed"
        );

        let payload = TransitionPayload {
            opportunity_id: opportunity_id.clone(),
            from,
            to,
            sub_state,
            trigger_type: options.trigger_type,
            trigger_reason: options.trigger_reason,
            triggered_by: options.triggered_by,
            state_id: record.id,
            metadata: record.metadata.clone(),
            timestamp,
        };
        self.push_history(payload.clone()).await;

        self.bus.publish(LifecycleEvent::Transition(payload));
        self.bus.publish(LifecycleEvent::Entered {
            state: to,
            opportunity_id: opportunity_id.clone(),
            timestamp,
        });
        if close_id.is_some() {
            // The very first transition for an opportunity has no "exited"
            // counterpart.
            self.bus.publish(LifecycleEvent::Exited {
                state: from,
                opportunity_id: opportunity_id.clone(),
                timestamp,
            });
        }
        self.emit_auto_actions(to, opportunity_id, &record.metadata, timestamp);

        if to.is_terminal() {
            drop(guard);
            self.evict_lock(opportunity_id).await;
        }

        Ok(TransitionReceipt {
            state_id: record.id,
            from: Some(from),
            to,
            sub_state,
            timestamp,
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The opportunity's current open record.
    pub async fn current_state(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Option<LifecycleRecord>, EngineError> {
        Ok(self.store.current_state(opportunity_id).await?)
    }

    /// Whether the opportunity is currently in `state`.
    pub async fn is_in_state(
        &self,
        opportunity_id: &OpportunityId,
        state: OpportunityState,
    ) -> Result<bool, EngineError> {
        Ok(self
            .store
            .current_state(opportunity_id)
            .await?
            .is_some_and(|record| record.state == state))
    }

    /// Recent transitions from the in-process ring, optionally filtered by
    /// opportunity. Best-effort introspection only: bounded, process-scoped,
    /// and not a substitute for `state_timings`.
    pub async fn recent_transitions(
        &self,
        opportunity_id: Option<&OpportunityId>,
    ) -> Vec<TransitionPayload> {
        let history = self.history.read().await;
        history
            .iter()
            .filter(|p| opportunity_id.is_none_or(|id| &p.opportunity_id == id))
            .cloned()
            .collect()
    }

    /// Durable per-interval timing view of the audit trail, oldest first.
    pub async fn state_timings(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<StateTiming>, EngineError> {
        let history = self.store.lifecycle_history(opportunity_id).await?;
        Ok(history.iter().map(StateTiming::from).collect())
    }

    /// Snapshot of currently-open records in `state`.
    pub async fn opportunities_in_state(
        &self,
        state: OpportunityState,
        query: StateQuery,
    ) -> Result<Vec<OpenInterval>, EngineError> {
        Ok(self.store.opportunities_in_state(state, query).await?)
    }

    /// Per-state aggregate duration statistics over closed records.
    pub async fn analytics(&self) -> Result<Vec<StateStats>, EngineError> {
        Ok(self.store.state_analytics().await?)
    }

    /// Open records in `from_state` older than `hours_in_state`, for the
    /// external auto-transition scheduler.
    pub async fn eligible_for_auto_transition(
        &self,
        from_state: OpportunityState,
        hours_in_state: f64,
    ) -> Result<Vec<LifecycleRecord>, EngineError> {
        Ok(self
            .store
            .eligible_for_auto_transition(from_state, hours_in_state)
            .await?)
    }

    /// Open records in `from_state` older than `days_inactive`, for the
    /// external dormancy scheduler.
    pub async fn eligible_for_dormancy(
        &self,
        from_state: OpportunityState,
        days_inactive: f64,
    ) -> Result<Vec<LifecycleRecord>, EngineError> {
        Ok(self
            .store
            .eligible_for_dormancy(from_state, days_inactive)
            .await?)
    }

    /// Most frequent transition pairs over the audit log.
    pub async fn common_paths(&self, limit: usize) -> Result<Vec<PathCount>, EngineError> {
        Ok(self.store.common_paths(limit).await?)
    }

    /// Mean journey duration for opportunities that reached CLOSED.
    pub async fn average_journey_duration(&self) -> Result<Option<f64>, EngineError> {
        Ok(self.store.average_journey_duration().await?)
    }

    /// The full state machine graph for visualization.
    pub fn graph(&self) -> StateGraph {
        definition::graph()
    }

    /// The exact set of states reachable from `state`.
    pub fn valid_next_states(&self, state: OpportunityState) -> &'static [OpportunityState] {
        state.valid_targets()
    }

    /// Whether the edge `(from, to)` exists in the transition graph.
    pub fn is_valid_transition(&self, from: OpportunityState, to: OpportunityState) -> bool {
        validator::check_edge(from, to)
    }

    /// Whether `name` is a recognized state wire name.
    pub fn is_valid_state(&self, name: &str) -> bool {
        OpportunityState::parse(name).is_some()
    }

    /// Whether `name` is a recognized closed-outcome wire name.
    pub fn is_valid_sub_state(&self, name: &str) -> bool {
        ClosedOutcome::parse(name).is_some()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Acquire the serialization lock for one opportunity.
    async fn lock_for(&self, opportunity_id: &OpportunityId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(opportunity_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Remove the opportunity's lock entry if nothing else holds or awaits
    /// it. Called after terminal transitions; a later reopen recreates the
    /// entry on demand.
    async fn evict_lock(&self, opportunity_id: &OpportunityId) {
        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.get(opportunity_id) {
            // The map itself accounts for one reference; any more means a
            // concurrent caller is holding or awaiting the lock.
            if Arc::strong_count(lock) == 1 {
                locks.remove(opportunity_id);
            }
        }
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Run the persistence step under the configured timeout. When
    /// `close_id` is set the close and create happen in one atomic store
    /// operation; either way the newly opened record is returned.
    async fn persist_bounded(
        &self,
        close_id: Option<RecordId>,
        new: NewRecord,
    ) -> Result<LifecycleRecord, EngineError> {
        let timeout = self.config.transition_timeout;
        let result = tokio::time::timeout(timeout, async {
            match close_id {
                Some(id) => self.store.advance(id, new).await.map(|a| a.opened),
                None => self.store.create_state(new).await,
            }
        })
        .await;

        match result {
            Ok(persisted) => Ok(persisted?),
            Err(_) => Err(EngineError::Timeout { timeout }),
        }
    }

    async fn push_history(&self, payload: TransitionPayload) {
        if self.config.history_capacity == 0 {
            return;
        }
        let mut history = self.history.write().await;
        if history.len() >= self.config.history_capacity {
            history.pop_front();
        }
        history.push_back(payload);
    }

    fn emit_auto_actions(
        &self,
        state: OpportunityState,
        opportunity_id: &OpportunityId,
        metadata: &serde_json::Value,
        timestamp: chrono::DateTime<Utc>,
    ) {
        for action in state.auto_actions() {
            self.bus.publish(LifecycleEvent::AutoAction(AutoActionPayload {
                action: (*action).to_string(),
                state,
                opportunity_id: opportunity_id.clone(),
                metadata: metadata.clone(),
                timestamp,
            }));
        }
    }
}
