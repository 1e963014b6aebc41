//! Static state catalog for the opportunity lifecycle.
//!
//! This module is the single source of truth for the seven lifecycle states,
//! the three closed-outcome sub-states, the trigger kinds, the directed
//! transition graph, and the per-state auto-action lists. Everything here is
//! fixed data; the validator and engine are defined over it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The seven opportunity lifecycle states.
///
/// `Discovered` is the designated entry state; `Closed` is terminal for
/// automatic flow but keeps one deliberate outgoing edge back to `Qualified`
/// for manual reopening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityState {
    Discovered,
    Qualified,
    Outreach,
    Engaged,
    Negotiating,
    Dormant,
    Closed,
}

/// All states, in catalog order. Used by graph snapshots and tests.
pub const ALL_STATES: [OpportunityState; 7] = [
    OpportunityState::Discovered,
    OpportunityState::Qualified,
    OpportunityState::Outreach,
    OpportunityState::Engaged,
    OpportunityState::Negotiating,
    OpportunityState::Dormant,
    OpportunityState::Closed,
];

impl OpportunityState {
    /// Wire name of this state (e.g. `QUALIFIED`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "DISCOVERED",
            Self::Qualified => "QUALIFIED",
            Self::Outreach => "OUTREACH",
            Self::Engaged => "ENGAGED",
            Self::Negotiating => "NEGOTIATING",
            Self::Dormant => "DORMANT",
            Self::Closed => "CLOSED",
        }
    }

    /// Parse from the wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DISCOVERED" => Some(Self::Discovered),
            "QUALIFIED" => Some(Self::Qualified),
            "OUTREACH" => Some(Self::Outreach),
            "ENGAGED" => Some(Self::Engaged),
            "NEGOTIATING" => Some(Self::Negotiating),
            "DORMANT" => Some(Self::Dormant),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Whether this is the designated entry state.
    pub fn is_entry(&self) -> bool {
        matches!(self, Self::Discovered)
    }

    /// Whether this state is terminal for automatic flow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Human-readable label for visualization consumers.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Discovered => "Discovered",
            Self::Qualified => "Qualified",
            Self::Outreach => "Outreach",
            Self::Engaged => "Engaged",
            Self::Negotiating => "Negotiating",
            Self::Dormant => "Dormant",
            Self::Closed => "Closed",
        }
    }

    /// The exact set of states reachable from this one.
    ///
    /// This table is the transition graph; it must not be edited without a
    /// matching change to every external consumer of transition events.
    /// `Closed -> Qualified` is the intentional manual reopen edge, not a
    /// graph-completeness bug.
    pub fn valid_targets(&self) -> &'static [OpportunityState] {
        use OpportunityState::*;
        match self {
            Discovered => &[Qualified, Closed],
            Qualified => &[Outreach, Closed],
            Outreach => &[Engaged, Dormant, Closed],
            Engaged => &[Negotiating, Dormant, Closed],
            Negotiating => &[Engaged, Dormant, Closed],
            Dormant => &[Outreach, Qualified, Closed],
            Closed => &[Qualified],
        }
    }

    /// Auto-action names dispatched on entering this state.
    ///
    /// Fixed data: external workers key off these exact names, so the lists
    /// are part of the event contract.
    pub fn auto_actions(&self) -> &'static [&'static str] {
        match self {
            Self::Discovered => &["evaluate_fit"],
            Self::Qualified => &["identify_contacts", "generate_strategy", "calculate_tiers"],
            Self::Outreach => &["generate_outreach", "schedule_followup"],
            Self::Engaged => &["notify_owner", "refresh_scoring"],
            Self::Negotiating => &["prepare_proposal"],
            Self::Dormant => &["schedule_reactivation"],
            Self::Closed => &["archive_artifacts"],
        }
    }
}

impl fmt::Display for OpportunityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-states of `Closed`. Meaningful only when the state is `Closed`;
/// closing without an outcome is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClosedOutcome {
    Won,
    Lost,
    Disqualified,
}

impl ClosedOutcome {
    /// Wire name of this outcome (e.g. `WON`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Won => "WON",
            Self::Lost => "LOST",
            Self::Disqualified => "DISQUALIFIED",
        }
    }

    /// Parse from the wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WON" => Some(Self::Won),
            "LOST" => Some(Self::Lost),
            "DISQUALIFIED" => Some(Self::Disqualified),
            _ => None,
        }
    }
}

impl fmt::Display for ClosedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of what caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// Fired by a time-driven scheduler.
    Auto,
    /// Manual user action.
    Manual,
    /// External event (webhook, enrichment, etc.).
    Event,
}

impl TriggerType {
    /// Wire name of this trigger kind (e.g. `manual`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::Event => "event",
        }
    }

    /// Parse from the wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

impl Default for TriggerType {
    fn default() -> Self {
        Self::Manual
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label for a transition edge, keyed by the enum pair rather than by
/// string concatenation so every edge is covered at compile time.
pub fn edge_label(from: OpportunityState, to: OpportunityState) -> Option<&'static str> {
    use OpportunityState::*;
    match (from, to) {
        (Discovered, Qualified) => Some("qualify"),
        (Qualified, Outreach) => Some("start outreach"),
        (Outreach, Engaged) => Some("engage"),
        (Engaged, Negotiating) => Some("negotiate"),
        (Negotiating, Engaged) => Some("continue engagement"),
        (Outreach, Dormant) | (Engaged, Dormant) | (Negotiating, Dormant) => Some("go dormant"),
        (Dormant, Outreach) => Some("resume outreach"),
        (Dormant, Qualified) => Some("requalify"),
        (Closed, Qualified) => Some("reopen"),
        (
            Discovered | Qualified | Outreach | Engaged | Negotiating | Dormant,
            Closed,
        ) => Some("close"),
        _ => None,
    }
}

// =============================================================================
// Graph snapshot
// =============================================================================

/// A node in the state machine graph snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateNode {
    pub state: OpportunityState,
    pub label: &'static str,
    pub is_entry: bool,
    pub is_terminal: bool,
    pub auto_actions: Vec<&'static str>,
}

/// A directed edge in the state machine graph snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateEdge {
    pub from: OpportunityState,
    pub to: OpportunityState,
    pub label: &'static str,
}

/// The full state machine graph, for visualization and introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateGraph {
    pub nodes: Vec<StateNode>,
    pub edges: Vec<StateEdge>,
}

/// Build the graph snapshot from the static catalog.
pub fn graph() -> StateGraph {
    let nodes = ALL_STATES
        .iter()
        .map(|&state| StateNode {
            state,
            label: state.label(),
            is_entry: state.is_entry(),
            is_terminal: state.is_terminal(),
            auto_actions: state.auto_actions().to_vec(),
        })
        .collect();

    let edges = ALL_STATES
        .iter()
        .flat_map(|&from| {
            from.valid_targets().iter().map(move |&to| StateEdge {
                from,
                to,
                label: edge_label(from, to).unwrap_or(""),
            })
        })
        .collect();

    StateGraph { nodes, edges }
}
