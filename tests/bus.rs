//! Event Bus Integration Tests
//!
//! Publish/query round-trips, subscriber computation, and the
//! human-in-the-loop response lifecycle.

mod common;

use serde_json::json;
use uuid::Uuid;

use agentmesh::core::bus::EventFilter;
use agentmesh::core::Subscription;
use agentmesh::domain::HumanInteraction;
use agentmesh::{BusError, EventBus, EventStatus};

fn bus() -> EventBus {
    EventBus::in_memory().unwrap()
}

#[test]
fn test_publish_and_get_round_trip() {
    let bus = bus();

    let details = json!({"run_id": "abc", "nested": {"cost": 0.25}});
    let outcome = bus
        .publish("engine", "chain_completed", Some("ops"), details.clone(), None)
        .unwrap();

    let event = bus.get(outcome.event_id).unwrap();
    assert_eq!(event.source, "engine");
    assert_eq!(event.action, "chain_completed");
    assert_eq!(event.target.as_deref(), Some("ops"));
    assert_eq!(event.details, details);
    // Not a human-input event: terminal immediately
    assert_eq!(event.status, EventStatus::Completed);
    assert!(!event.requires_human);
}

#[test]
fn test_get_unknown_event_is_not_found() {
    let bus = bus();
    let missing = Uuid::new_v4();

    match bus.get(missing) {
        Err(BusError::NotFound(id)) => assert_eq!(id, missing),
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[test]
fn test_blank_action_rejected() {
    let bus = bus();

    let result = bus.publish("engine", "   ", None, json!({}), None);
    assert!(matches!(result, Err(BusError::InvalidEvent)));
}

#[test]
fn test_subscribers_stamped_at_publish() {
    let bus = bus();
    bus.subscribe(Subscription::new("auditor", "*"));
    bus.subscribe(Subscription::new("alerter", "chain_*").with_priority(10));
    bus.subscribe(Subscription::new("irrelevant", "price_update"));

    let outcome = bus
        .publish("engine", "chain_failed", None, json!({}), None)
        .unwrap();

    // Priority order, non-matching pattern excluded
    assert_eq!(outcome.subscribed_agents, vec!["alerter", "auditor"]);

    let event = bus.get(outcome.event_id).unwrap();
    assert_eq!(event.subscribed_agents, vec!["alerter", "auditor"]);
}

#[test]
fn test_disabled_subscriber_excluded() {
    let bus = bus();
    bus.subscribe(Subscription::new("auditor", "*"));
    bus.set_subscriber_enabled("auditor", false);

    let outcome = bus.publish("engine", "anything", None, json!({}), None).unwrap();
    assert!(outcome.subscribed_agents.is_empty());
}

#[test]
fn test_list_with_filters() {
    let bus = bus();
    bus.publish("engine", "chain_started", None, json!({}), None).unwrap();
    bus.publish("engine", "chain_completed", None, json!({}), None).unwrap();
    bus.publish("router", "request_routed", None, json!({}), None).unwrap();

    let from_engine = bus
        .list(&EventFilter {
            source: Some("engine".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(from_engine.len(), 2);

    let routed = bus
        .list(&EventFilter {
            action: Some("request_routed".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0].source, "router");

    let limited = bus
        .list(&EventFilter {
            limit: Some(1),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[test]
fn test_repeat_acknowledge_refreshes_timestamp() {
    let bus = bus();
    let outcome = bus.publish("engine", "chain_started", None, json!({}), None).unwrap();

    bus.acknowledge(outcome.event_id, "auditor").unwrap();
    let first = bus.get(outcome.event_id).unwrap();
    let first_at = first.acknowledged_by.get("auditor").copied().unwrap();

    // A repeat ack succeeds and moves the timestamp forward
    std::thread::sleep(std::time::Duration::from_millis(5));
    bus.acknowledge(outcome.event_id, "auditor").unwrap();
    let second = bus.get(outcome.event_id).unwrap();
    assert_eq!(second.acknowledged_by.len(), 1);
    assert!(second.acknowledged_by.get("auditor").copied().unwrap() > first_at);
}

#[test]
fn test_human_response_lifecycle() {
    let bus = bus();
    let human = HumanInteraction {
        question: "Approve the deploy?".to_string(),
        options: vec!["yes".to_string(), "no".to_string()],
        timeout_seconds: Some(300),
        fallback: Some("no".to_string()),
    };
    let outcome = bus
        .publish("deployer", "approval_needed", None, json!({}), Some(human))
        .unwrap();

    let event = bus.get(outcome.event_id).unwrap();
    assert_eq!(event.status, EventStatus::Pending);
    assert!(event.awaiting_human());

    let pending = bus.pending_human().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event.id, outcome.event_id);
    assert!(pending[0].timeout_at.is_some());

    bus.respond(outcome.event_id, "yes", "alice").unwrap();

    let event = bus.get(outcome.event_id).unwrap();
    assert_eq!(event.status, EventStatus::Completed);
    assert_eq!(event.response.as_deref(), Some("yes"));
    assert_eq!(event.responder.as_deref(), Some("alice"));
    assert!(event.responded_at.is_some());
    assert!(bus.pending_human().unwrap().is_empty());
}

#[test]
fn test_second_response_rejected() {
    let bus = bus();
    let human = HumanInteraction {
        question: "Proceed?".to_string(),
        options: Vec::new(),
        timeout_seconds: None,
        fallback: None,
    };
    let outcome = bus
        .publish("deployer", "approval_needed", None, json!({}), Some(human))
        .unwrap();

    bus.respond(outcome.event_id, "yes", "alice").unwrap();

    match bus.respond(outcome.event_id, "no", "bob") {
        Err(BusError::InvalidState { id, .. }) => assert_eq!(id, outcome.event_id),
        other => panic!("expected InvalidState, got {:?}", other),
    }

    // First answer stands
    let event = bus.get(outcome.event_id).unwrap();
    assert_eq!(event.response.as_deref(), Some("yes"));
}

#[test]
fn test_respond_to_plain_event_rejected() {
    let bus = bus();
    let outcome = bus.publish("engine", "chain_started", None, json!({}), None).unwrap();

    assert!(matches!(
        bus.respond(outcome.event_id, "yes", "alice"),
        Err(BusError::InvalidState { .. })
    ));
}
