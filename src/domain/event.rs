//! Event Bus records.
//!
//! Events are append-only once published. The only fields ever mutated
//! after insert are the human-response fields (`response`,
//! `responded_at`, `responder`, `status`) and the acknowledgment map.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event on the coordination bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event was published
    pub timestamp: DateTime<Utc>,

    /// Publishing component or agent
    pub source: String,

    /// What happened (e.g. `chain_started`, `backup_completed`)
    pub action: String,

    /// Optional target agent or resource
    pub target: Option<String>,

    /// Structured payload
    pub details: serde_json::Value,

    /// Whether resolution needs an out-of-band human decision
    pub requires_human: bool,

    /// Question posed to the human (if `requires_human`)
    pub question: Option<String>,

    /// Choices offered to the human
    pub options: Vec<String>,

    /// Seconds before the fallback applies
    pub timeout_seconds: Option<u64>,

    /// Value assumed when the human does not answer in time
    pub fallback: Option<String>,

    /// The human's answer; set at most once
    pub response: Option<String>,

    /// When the answer arrived
    pub responded_at: Option<DateTime<Utc>>,

    /// Who answered
    pub responder: Option<String>,

    /// Subscribers matched at publish time; informational, subscribers
    /// poll the bus rather than receive pushes
    pub subscribed_agents: Vec<String>,

    /// Agent name -> acknowledgment timestamp
    pub acknowledged_by: HashMap<String, DateTime<Utc>>,

    /// Lifecycle status
    pub status: EventStatus,
}

impl Event {
    /// Build a new event. Non-human events are terminal at publish;
    /// only human-required events start out pending.
    pub fn new(source: &str, action: &str, target: Option<&str>, details: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.to_string(),
            action: action.to_string(),
            target: target.map(str::to_string),
            details,
            requires_human: false,
            question: None,
            options: Vec::new(),
            timeout_seconds: None,
            fallback: None,
            response: None,
            responded_at: None,
            responder: None,
            subscribed_agents: Vec::new(),
            acknowledged_by: HashMap::new(),
            status: EventStatus::Completed,
        }
    }

    /// Attach a human-interaction request; the event becomes pending.
    pub fn with_human(mut self, human: HumanInteraction) -> Self {
        self.requires_human = true;
        self.question = Some(human.question);
        self.options = human.options;
        self.timeout_seconds = human.timeout_seconds;
        self.fallback = human.fallback;
        self.status = EventStatus::Pending;
        self
    }

    /// When the human-response window closes, if one is configured.
    pub fn timeout_at(&self) -> Option<DateTime<Utc>> {
        self.timeout_seconds
            .map(|secs| self.timestamp + Duration::seconds(secs as i64))
    }

    /// Whether this event still awaits a human answer.
    pub fn awaiting_human(&self) -> bool {
        self.requires_human && self.response.is_none() && self.status == EventStatus::Pending
    }
}

/// Lifecycle status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Awaiting a human response
    Pending,

    /// Terminal; nothing left to resolve
    Completed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A request for an out-of-band human decision, attached at publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanInteraction {
    pub question: String,

    #[serde(default)]
    pub options: Vec<String>,

    /// Seconds the human has before the fallback applies
    pub timeout_seconds: Option<u64>,

    /// Value assumed on timeout
    pub fallback: Option<String>,
}

/// A pending human-required event annotated with its computed deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingHumanEvent {
    pub event: Event,
    pub timeout_at: Option<DateTime<Utc>>,
}
