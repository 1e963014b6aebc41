//! Typed lifecycle events and the fire-and-forget event bus.
//!
//! External subsystems (outreach generation, scoring re-evaluation, webhook
//! delivery, enrichment) react to stage changes through these events. The sum
//! type replaces string-keyed event names so consumers get exhaustiveness
//! checking; delivery is a `tokio::sync::broadcast` channel, so a slow or
//! failing subscriber can never fail the transition that already committed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::definition::{ClosedOutcome, OpportunityState, TriggerType};
use crate::record::{OpportunityId, RecordId};

/// Full payload of a committed transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionPayload {
    pub opportunity_id: OpportunityId,
    pub from: OpportunityState,
    pub to: OpportunityState,
    pub sub_state: Option<ClosedOutcome>,
    pub trigger_type: TriggerType,
    pub trigger_reason: String,
    pub triggered_by: Option<String>,
    pub state_id: RecordId,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Payload of one auto-action dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoActionPayload {
    pub action: String,
    pub state: OpportunityState,
    pub opportunity_id: OpportunityId,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// All events emitted by the engine, in the order they are dispatched for a
/// single transition: `Transition`, `Entered`, `Exited` (only when a prior
/// record existed), then one `AutoAction` per configured action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// A transition committed; carries the full transition payload.
    Transition(TransitionPayload),
    /// The opportunity entered `state`.
    Entered {
        state: OpportunityState,
        opportunity_id: OpportunityId,
        timestamp: DateTime<Utc>,
    },
    /// The opportunity exited `state`. Not emitted for the very first
    /// transition of an opportunity (nothing was exited).
    Exited {
        state: OpportunityState,
        opportunity_id: OpportunityId,
        timestamp: DateTime<Utc>,
    },
    /// A named side-effect task for external workers to execute.
    AutoAction(AutoActionPayload),
}

impl LifecycleEvent {
    /// Short description for logging, without the metadata payload.
    pub fn log_summary(&self) -> String {
        match self {
            Self::Transition(p) => {
                format!("Transition {{ {}: {} -> {} }}", p.opportunity_id, p.from, p.to)
            }
            Self::Entered {
                state,
                opportunity_id,
                ..
            } => format!("Entered {{ {opportunity_id}: {state} }}"),
            Self::Exited {
                state,
                opportunity_id,
                ..
            } => format!("Exited {{ {opportunity_id}: {state} }}"),
            Self::AutoAction(p) => {
                format!("AutoAction {{ {}: {} on {} }}", p.opportunity_id, p.action, p.state)
            }
        }
    }
}

/// Default capacity of the broadcast channel. Consumers that fall further
/// behind than this lose old events rather than blocking the publisher.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fire-and-forget event publisher.
///
/// Wraps a broadcast channel: `publish` never blocks and never fails the
/// caller. `Sender::send` returns an error when there are no active
/// receivers, which is the normal idle condition here, so that result is
/// deliberately ignored.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: LifecycleEvent) {
        debug!("event: {}", event.log_summary());
        let _ = self.sender.send(event);
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
