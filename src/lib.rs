//! Opportunity lifecycle state machine with durable interval storage.
//!
//! An opportunity moves through a fixed seven-state graph (DISCOVERED,
//! QUALIFIED, OUTREACH, ENGAGED, NEGOTIATING, DORMANT, CLOSED). Every stay in
//! a state is recorded as an append-only interval row: entering a state opens
//! a row, leaving it closes that row and opens the next one in a single
//! atomic storage operation. Historical rows are never updated or deleted, so
//! the store doubles as a complete audit trail and the substrate for the
//! timing analytics.
//!
//! The crate splits into:
//! - [`definition`]: the state set, transition graph, auto-action tables and
//!   edge labels. Pure data, no I/O.
//! - [`validator`]: transition validation over both typed and raw wire
//!   inputs, reporting every violation rather than the first.
//! - [`repository`]: the [`repository::LifecycleStore`] trait with in-memory
//!   and SQLite backends.
//! - [`engine`]: the [`engine::LifecycleEngine`] orchestrator, which
//!   serializes per-opportunity mutations, persists them, and broadcasts
//!   typed lifecycle events to subscribers.

pub mod config;
pub mod definition;
pub mod engine;
pub mod event;
pub mod record;
pub mod repository;
pub mod validator;

pub use config::{EngineConfig, StoreConfig};
pub use definition::{ClosedOutcome, OpportunityState, TriggerType};
pub use engine::{EngineError, InitOptions, LifecycleEngine, TransitionOptions, TransitionReceipt};
pub use event::{EventBus, LifecycleEvent};
pub use record::{LifecycleRecord, NewRecord, OpportunityId, RecordId, StateTiming};
pub use repository::{
    InMemoryStore, LifecycleStore, RepositoryError, SqliteStore, StateQuery,
};
