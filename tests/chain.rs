//! Chain Engine Integration Tests
//!
//! Validation gating, template resolution, retries, timeouts,
//! cancellation, and cost accounting against a scripted agent client.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use agentmesh::core::bus::EventFilter;
use agentmesh::core::{ExecutionLimits, Registry, RetryPolicy, Step};
use agentmesh::{EventBus, Orchestrator, RunStatus, StepStatus};

use common::{MockAgent, Outcome};

/// Ad-hoc step with a fast retry policy so tests do not sleep.
fn step(id: &str, agent: &str, action: &str, params: Value) -> Step {
    Step {
        id: id.to_string(),
        agent: agent.to_string(),
        action: action.to_string(),
        params,
        max_retries: 2,
        timeout_seconds: None,
        retry_policy: RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 1.0,
        },
    }
}

fn engine(mock: Arc<MockAgent>) -> Orchestrator {
    common::orchestrator(mock, ExecutionLimits::default())
}

#[tokio::test]
async fn test_unknown_agent_makes_no_calls() {
    let mock = Arc::new(MockAgent::new());
    let engine = engine(mock.clone());

    let steps = vec![step("a", "nobody", "search", json!({}))];
    let result = engine.execute_ad_hoc(steps, Value::Null).await;

    assert!(result.is_err());
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_unresolved_reference_rejected_before_execution() {
    let mock = Arc::new(MockAgent::new());
    let engine = engine(mock.clone());

    let steps = vec![step(
        "a",
        "researcher",
        "search",
        json!({"query": "{{missing.value}}"}),
    )];
    let result = engine.execute_ad_hoc(steps, Value::Null).await;

    assert!(result.is_err());
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_forward_reference_rejected() {
    let mock = Arc::new(MockAgent::new());
    let engine = engine(mock.clone());

    let steps = vec![
        step("a", "researcher", "search", json!({"query": "{{b.ok}}"})),
        step("b", "writer", "draft", json!({})),
    ];
    let result = engine.execute_ad_hoc(steps, Value::Null).await;

    assert!(result.is_err());
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_named_chain_resolves_backward_references() {
    let mock = Arc::new(MockAgent::new());
    let engine = engine(mock.clone());

    let run = engine
        .execute_chain("research_and_write", json!({"topic": "rust"}))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.chain_name, "research_and_write");

    let calls = mock.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].action, "search");
    assert_eq!(calls[1].action, "draft");
    // The search echo flowed into the draft params
    assert_eq!(calls[0].params, json!({"query": "rust"}));
    assert_eq!(calls[1].params, json!({"source": "rust"}));
    // Sequential stages never overlap
    assert!(calls[0].at <= calls[1].at);
}

#[tokio::test]
async fn test_retryable_failure_retries_up_to_bound() {
    let mock = Arc::new(MockAgent::new());
    mock.fail_then_succeed("researcher", "search", 2);
    let engine = engine(mock.clone());

    let steps = vec![step("a", "researcher", "search", json!({}))];
    let run = engine.execute_ad_hoc(steps, Value::Null).await.unwrap();

    // max_retries = 2 means three attempts total
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.steps[0].status, StepStatus::Succeeded);
    assert_eq!(run.steps[0].attempts, 3);
    assert_eq!(mock.call_count(), 3);
}

#[tokio::test]
async fn test_retries_exhausted_fails_step() {
    let mock = Arc::new(MockAgent::new());
    for _ in 0..3 {
        mock.script(
            "researcher",
            "search",
            Outcome::Fail {
                message: "still down".to_string(),
                retryable: true,
                cost: 0.0,
            },
        );
    }
    let engine = engine(mock.clone());

    let steps = vec![step("a", "researcher", "search", json!({}))];
    let run = engine.execute_ad_hoc(steps, Value::Null).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.steps[0].status, StepStatus::Failed);
    assert_eq!(run.steps[0].attempts, 3);
    assert_eq!(mock.call_count(), 3);
}

#[tokio::test]
async fn test_non_retryable_failure_stops_immediately() {
    let mock = Arc::new(MockAgent::new());
    mock.script(
        "researcher",
        "search",
        Outcome::Fail {
            message: "bad request".to_string(),
            retryable: false,
            cost: 0.0,
        },
    );
    let engine = engine(mock.clone());

    let steps = vec![step("a", "researcher", "search", json!({}))];
    let run = engine.execute_ad_hoc(steps, Value::Null).await.unwrap();

    assert_eq!(run.steps[0].status, StepStatus::Failed);
    assert_eq!(run.steps[0].attempts, 1);
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn test_independent_step_survives_failure() {
    let mock = Arc::new(MockAgent::new());
    mock.script(
        "researcher",
        "search",
        Outcome::Fail {
            message: "no".to_string(),
            retryable: false,
            cost: 0.0,
        },
    );
    let engine = engine(mock.clone());

    // The second step consumes only run input, so it still runs
    let steps = vec![
        step("a", "researcher", "search", json!({})),
        step("b", "writer", "draft", json!({"source": "{{input.topic}}"})),
    ];
    let run = engine
        .execute_ad_hoc(steps, json!({"topic": "rust"}))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.steps[0].status, StepStatus::Failed);
    assert_eq!(run.steps[1].status, StepStatus::Succeeded);
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test]
async fn test_dependent_step_blocked_by_failure() {
    let mock = Arc::new(MockAgent::new());
    mock.script(
        "researcher",
        "search",
        Outcome::Fail {
            message: "no".to_string(),
            retryable: false,
            cost: 0.0,
        },
    );
    let engine = engine(mock.clone());

    let steps = vec![
        step("a", "researcher", "search", json!({})),
        step("b", "writer", "draft", json!({"source": "{{a.ok}}"})),
    ];
    let run = engine.execute_ad_hoc(steps, Value::Null).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.steps[1].status, StepStatus::Failed);
    // The blocked step never reached the client
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn test_cost_sums_every_attempt() {
    let mock = Arc::new(MockAgent::new());
    mock.script(
        "researcher",
        "search",
        Outcome::Fail {
            message: "flaky".to_string(),
            retryable: true,
            cost: 0.10,
        },
    );
    mock.script("researcher", "search", Outcome::Succeed(json!({"ok": true}), 0.25));
    mock.script("writer", "draft", Outcome::Succeed(json!({"ok": true}), 0.05));
    let engine = engine(mock.clone());

    let steps = vec![
        step("a", "researcher", "search", json!({})),
        step("b", "writer", "draft", json!({})),
    ];
    let run = engine.execute_ad_hoc(steps, Value::Null).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!((run.steps[0].cost - 0.35).abs() < 1e-9);
    assert!((run.total_cost - 0.40).abs() < 1e-9);
}

#[tokio::test]
async fn test_chain_deadline_aborts_run() {
    let mock = Arc::new(MockAgent::new().with_delay(Duration::from_secs(3)));
    let limits = ExecutionLimits {
        chain_timeout_seconds: 1,
        ..Default::default()
    };
    let engine = common::orchestrator(mock.clone(), limits);

    let steps = vec![step("a", "researcher", "search", json!({}))];
    let run = engine.execute_ad_hoc(steps, Value::Null).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.steps[0].status, StepStatus::Failed);
    assert_eq!(run.steps[0].error.as_deref(), Some("chain_timeout"));
}

#[tokio::test]
async fn test_late_in_flight_result_does_not_rewrite_settled_run() {
    let mock = Arc::new(MockAgent::new().with_delay(Duration::from_millis(1500)));
    let limits = ExecutionLimits {
        chain_timeout_seconds: 1,
        ..Default::default()
    };
    let bus = Arc::new(EventBus::in_memory().unwrap());
    let engine = common::orchestrator_with_bus(mock.clone(), limits, bus.clone());

    let steps = vec![step("a", "researcher", "search", json!({}))];
    let run = engine.execute_ad_hoc(steps, Value::Null).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    // Let the detached call finish well past the deadline
    tokio::time::sleep(Duration::from_secs(1)).await;

    let stored = engine.get_run(run.id).unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.steps[0].status, StepStatus::Failed);
    assert_eq!(stored.steps[0].error.as_deref(), Some("chain_timeout"));

    let succeeded = bus
        .list(&EventFilter {
            action: Some("step_succeeded".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert!(succeeded.is_empty());
}

#[tokio::test]
async fn test_step_timeout_is_retryable() {
    let mock = Arc::new(MockAgent::new());
    mock.script("researcher", "search", Outcome::Hang(Duration::from_secs(3)));
    let engine = engine(mock.clone());

    let mut hanging = step("a", "researcher", "search", json!({}));
    hanging.timeout_seconds = Some(1);
    hanging.max_retries = 1;

    let run = engine.execute_ad_hoc(vec![hanging], Value::Null).await.unwrap();

    // First attempt times out, second drains the script and succeeds
    assert_eq!(run.steps[0].status, StepStatus::Succeeded);
    assert_eq!(run.steps[0].attempts, 2);
}

#[tokio::test]
async fn test_cancellation_skips_remaining_stages() {
    let mock = Arc::new(MockAgent::new().with_delay(Duration::from_millis(300)));
    let engine = engine(mock.clone());

    let steps = vec![
        step("a", "researcher", "search", json!({})),
        step("b", "writer", "draft", json!({})),
    ];
    let handle = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.execute_ad_hoc(steps, Value::Null).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let running = engine.list_runs(10);
    assert_eq!(running.len(), 1);
    engine.cancel_run(running[0].id).unwrap();

    let run = handle.await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.steps[1].status, StepStatus::Cancelled);
    // The second stage never dispatched
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn test_parallel_stage_bounded_by_call_permits() {
    const FANOUT_YAML: &str = r#"
version: "1.0"

agents:
  researcher:
    location: http://localhost:9101
    actions:
      search:
        timeout_seconds: 5

chains:
  fanout:
    stages:
      - parallel:
          - id: a
            agent: researcher
            action: search
          - id: b
            agent: researcher
            action: search
          - id: c
            agent: researcher
            action: search
          - id: d
            agent: researcher
            action: search
"#;

    let mock = Arc::new(MockAgent::new().with_delay(Duration::from_millis(100)));
    let registry = Registry::from_yaml(FANOUT_YAML).unwrap();
    let limits = ExecutionLimits {
        max_parallel_calls: 2,
        ..Default::default()
    };
    let bus = Arc::new(EventBus::in_memory().unwrap());
    let engine = Orchestrator::new(Arc::new(registry), mock.clone(), bus, limits);

    let run = engine.execute_chain("fanout", Value::Null).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(mock.call_count(), 4);
    assert!(mock.max_in_flight() <= 2, "cap exceeded: {}", mock.max_in_flight());
}

#[tokio::test]
async fn test_lifecycle_events_published() {
    let mock = Arc::new(MockAgent::new());
    let bus = Arc::new(EventBus::in_memory().unwrap());
    let engine = common::orchestrator_with_bus(mock, ExecutionLimits::default(), bus.clone());

    let steps = vec![step("a", "researcher", "search", json!({}))];
    engine.execute_ad_hoc(steps, Value::Null).await.unwrap();

    let actions: Vec<String> = bus
        .list(&EventFilter::default())
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();

    assert!(actions.contains(&"chain_started".to_string()));
    assert!(actions.contains(&"step_started".to_string()));
    assert!(actions.contains(&"step_succeeded".to_string()));
    assert!(actions.contains(&"chain_completed".to_string()));
}
