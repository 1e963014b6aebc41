//! End-to-end engine tests over both storage backends.

use std::sync::Arc;
use std::time::Duration;

use oppstate::engine::{InitOptions, LifecycleEngine, TransitionOptions};
use oppstate::event::LifecycleEvent;
use oppstate::repository::{InMemoryStore, SqliteStore, StateQuery};
use oppstate::{ClosedOutcome, EngineConfig, EngineError, OpportunityId, OpportunityState};

fn opp(id: &str) -> OpportunityId {
    OpportunityId::new(id)
}

/// Route engine tracing through the test harness. `RUST_LOG` overrides the
/// default filter; repeat calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oppstate=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn compat_config() -> EngineConfig {
    EngineConfig {
        implicit_bootstrap: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_full_journey_over_sqlite() {
    init_tracing();
    let store = SqliteStore::new_in_memory().unwrap();
    let engine = LifecycleEngine::new(store, EngineConfig::default());
    let id = opp("acme-corp");

    engine.initialize(&id, InitOptions::default()).await.unwrap();
    for to in [
        OpportunityState::Qualified,
        OpportunityState::Outreach,
        OpportunityState::Engaged,
        OpportunityState::Negotiating,
    ] {
        engine
            .transition(&id, to, TransitionOptions::default())
            .await
            .unwrap();
    }
    let receipt = engine
        .transition(
            &id,
            OpportunityState::Closed,
            TransitionOptions {
                sub_state: Some(ClosedOutcome::Won),
                trigger_reason: "signed".to_string(),
                triggered_by: Some("alice".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(receipt.from, Some(OpportunityState::Negotiating));
    assert_eq!(receipt.sub_state, Some(ClosedOutcome::Won));

    let timings = engine.state_timings(&id).await.unwrap();
    assert_eq!(timings.len(), 6);
    // Every interval except the last is closed.
    for timing in &timings[..5] {
        assert!(timing.exited_at.is_some());
        assert!(timing.duration_seconds.is_some());
    }
    assert!(timings[5].exited_at.is_none());
    assert_eq!(timings[5].state, OpportunityState::Closed);
    assert_eq!(timings[5].sub_state, Some(ClosedOutcome::Won));
}

#[tokio::test]
async fn test_concurrent_transitions_keep_one_open_interval() {
    init_tracing();
    let engine = Arc::new(LifecycleEngine::new(InMemoryStore::new(), compat_config()));
    let id = opp("contested");
    engine
        .transition(&id, OpportunityState::Qualified, TransitionOptions::default())
        .await
        .unwrap();

    // Two racing transitions QUALIFIED -> OUTREACH. The graph has no
    // self-loops, so the loser observes the winner's OUTREACH state and
    // fails validation, and the store must end with exactly one open
    // interval.
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            tokio::spawn(async move {
                engine
                    .transition(&id, OpportunityState::Outreach, TransitionOptions::default())
                    .await
            })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);

    let timings = engine.state_timings(&id).await.unwrap();
    let open = timings.iter().filter(|t| t.exited_at.is_none()).count();
    assert_eq!(open, 1);
    assert_eq!(timings.len(), 2);
}

#[tokio::test]
async fn test_concurrent_initialize_single_winner() {
    init_tracing();
    let engine = Arc::new(LifecycleEngine::new(
        InMemoryStore::new(),
        EngineConfig::default(),
    ));
    let id = opp("raced-init");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            tokio::spawn(async move { engine.initialize(&id, InitOptions::default()).await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
    let timings = engine.state_timings(&id).await.unwrap();
    assert_eq!(timings.len(), 1);
}

#[tokio::test]
async fn test_event_sequence_for_transition() {
    init_tracing();
    let engine = LifecycleEngine::new(InMemoryStore::new(), EngineConfig::default());
    let id = opp("o1");
    engine.initialize(&id, InitOptions::default()).await.unwrap();

    let mut events = engine.subscribe();
    engine
        .transition(&id, OpportunityState::Qualified, TransitionOptions::default())
        .await
        .unwrap();

    let first = events.recv().await.unwrap();
    let transition_ts = match first {
        LifecycleEvent::Transition(payload) => {
            assert_eq!(payload.from, OpportunityState::Discovered);
            assert_eq!(payload.to, OpportunityState::Qualified);
            payload.timestamp
        }
        other => panic!("expected Transition first, got {other:?}"),
    };

    match events.recv().await.unwrap() {
        LifecycleEvent::Entered {
            state, timestamp, ..
        } => {
            assert_eq!(state, OpportunityState::Qualified);
            assert_eq!(timestamp, transition_ts);
        }
        other => panic!("expected Entered, got {other:?}"),
    }

    match events.recv().await.unwrap() {
        LifecycleEvent::Exited {
            state, timestamp, ..
        } => {
            assert_eq!(state, OpportunityState::Discovered);
            assert_eq!(timestamp, transition_ts);
        }
        other => panic!("expected Exited, got {other:?}"),
    }

    // QUALIFIED fans out to exactly three auto-actions, in table order,
    // sharing the transition timestamp.
    let mut actions = Vec::new();
    for _ in 0..3 {
        match events.recv().await.unwrap() {
            LifecycleEvent::AutoAction(payload) => {
                assert_eq!(payload.state, OpportunityState::Qualified);
                assert_eq!(payload.timestamp, transition_ts);
                actions.push(payload.action);
            }
            other => panic!("expected AutoAction, got {other:?}"),
        }
    }
    assert_eq!(
        actions,
        vec!["identify_contacts", "generate_strategy", "calculate_tiers"]
    );
}

#[tokio::test]
async fn test_no_exited_event_for_bootstrap_transition() {
    let engine = LifecycleEngine::new(InMemoryStore::new(), compat_config());
    let mut events = engine.subscribe();

    engine
        .transition(&opp("o1"), OpportunityState::Qualified, TransitionOptions::default())
        .await
        .unwrap();

    assert!(matches!(
        events.recv().await.unwrap(),
        LifecycleEvent::Transition(_)
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        LifecycleEvent::Entered { .. }
    ));
    // No prior interval existed, so the next event is already an AutoAction.
    assert!(matches!(
        events.recv().await.unwrap(),
        LifecycleEvent::AutoAction(_)
    ));
}

#[tokio::test]
async fn test_initialize_emits_entered_and_discovered_actions() {
    let engine = LifecycleEngine::new(InMemoryStore::new(), EngineConfig::default());
    let mut events = engine.subscribe();

    engine
        .initialize(&opp("o1"), InitOptions::default())
        .await
        .unwrap();

    match events.recv().await.unwrap() {
        LifecycleEvent::Entered { state, .. } => {
            assert_eq!(state, OpportunityState::Discovered)
        }
        other => panic!("expected Entered, got {other:?}"),
    }
    match events.recv().await.unwrap() {
        LifecycleEvent::AutoAction(payload) => {
            assert_eq!(payload.action, "evaluate_fit");
        }
        other => panic!("expected AutoAction, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_transition_emits_nothing() {
    let engine = LifecycleEngine::new(InMemoryStore::new(), compat_config());
    let id = opp("o1");
    engine
        .transition(&id, OpportunityState::Qualified, TransitionOptions::default())
        .await
        .unwrap();

    let mut events = engine.subscribe();
    let err = engine
        .transition(&id, OpportunityState::Negotiating, TransitionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_strict_mode_unknown_opportunity_over_sqlite() {
    let store = SqliteStore::new_in_memory().unwrap();
    let engine = LifecycleEngine::new(store, EngineConfig::default());
    let err = engine
        .transition(
            &opp("never-seen"),
            OpportunityState::Qualified,
            TransitionOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownOpportunity { .. }));
}

#[tokio::test]
async fn test_metadata_flows_through_unexamined() {
    let engine = LifecycleEngine::new(InMemoryStore::new(), compat_config());
    let id = opp("o1");
    let metadata = serde_json::json!({
        "source": "webinar",
        "score": {"fit": 0.84, "notes": [1, 2, 3]},
    });

    engine
        .transition(
            &id,
            OpportunityState::Qualified,
            TransitionOptions {
                metadata: metadata.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let current = engine.current_state(&id).await.unwrap().unwrap();
    assert_eq!(current.metadata, metadata);
}

#[tokio::test]
async fn test_opportunities_in_state_sees_only_open_records() {
    let engine = LifecycleEngine::new(InMemoryStore::new(), compat_config());
    for name in ["a", "b", "c"] {
        engine
            .transition(&opp(name), OpportunityState::Qualified, TransitionOptions::default())
            .await
            .unwrap();
    }
    // Move one of them on.
    engine
        .transition(&opp("b"), OpportunityState::Outreach, TransitionOptions::default())
        .await
        .unwrap();

    let qualified = engine
        .opportunities_in_state(OpportunityState::Qualified, StateQuery::default())
        .await
        .unwrap();
    let mut ids: Vec<String> = qualified
        .iter()
        .map(|interval| interval.record.opportunity_id.to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "c"]);

    let outreach = engine
        .opportunities_in_state(OpportunityState::Outreach, StateQuery::default())
        .await
        .unwrap();
    assert_eq!(outreach.len(), 1);
}

#[tokio::test]
async fn test_common_paths_and_journey_over_sqlite() {
    let store = SqliteStore::new_in_memory().unwrap();
    let engine = LifecycleEngine::new(store, compat_config());

    for name in ["a", "b"] {
        for to in [
            OpportunityState::Qualified,
            OpportunityState::Outreach,
            OpportunityState::Engaged,
        ] {
            engine
                .transition(&opp(name), to, TransitionOptions::default())
                .await
                .unwrap();
        }
    }
    engine
        .transition(
            &opp("a"),
            OpportunityState::Dormant,
            TransitionOptions::default(),
        )
        .await
        .unwrap();

    let paths = engine.common_paths(10).await.unwrap();
    assert_eq!(paths[0].count, 2);
    // QUALIFIED->OUTREACH and OUTREACH->ENGAGED both occurred twice;
    // ENGAGED->DORMANT once.
    assert!(paths
        .iter()
        .any(|p| p.from == OpportunityState::Engaged
            && p.to == OpportunityState::Dormant
            && p.count == 1));

    // Nobody reached CLOSED yet.
    assert_eq!(engine.average_journey_duration().await.unwrap(), None);

    engine
        .transition(
            &opp("a"),
            OpportunityState::Closed,
            TransitionOptions {
                sub_state: Some(ClosedOutcome::Lost),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(engine.average_journey_duration().await.unwrap().is_some());
}

#[tokio::test]
async fn test_graph_snapshot_shape() {
    let engine = LifecycleEngine::new(InMemoryStore::new(), EngineConfig::default());
    let graph = engine.graph();
    assert_eq!(graph.nodes.len(), 7);
    assert_eq!(graph.edges.len(), 17);
    assert!(graph
        .edges
        .iter()
        .any(|e| e.from == OpportunityState::Closed
            && e.to == OpportunityState::Qualified
            && e.label == "reopen"));
}

#[tokio::test]
async fn test_timeout_configuration_is_honored_on_healthy_store() {
    // A generous bound on a healthy store never trips.
    let engine = LifecycleEngine::new(
        SqliteStore::new_in_memory().unwrap(),
        EngineConfig {
            implicit_bootstrap: true,
            transition_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    );
    engine
        .transition(&opp("o1"), OpportunityState::Qualified, TransitionOptions::default())
        .await
        .unwrap();
}
