//! Durable, queryable event bus backed by SQLite.
//!
//! Every publish is synchronously durable before returning. Events are
//! append-only except for the human-response fields and the
//! acknowledgment map. Nothing is ever deleted here; retention is
//! external housekeeping.
//!
//! The bus is a coordination aid, not a correctness-critical
//! transaction log: callers treat publish failures as non-fatal to
//! their own operation (log and continue).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::debug;
use uuid::Uuid;

use crate::adapters::notifier::{Notification, Notifier, Priority};
use crate::domain::{Event, EventStatus, HumanInteraction, PendingHumanEvent};
use crate::error::BusError;

use super::subscriptions::{ActionPattern, Subscription, SubscriptionTable};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id                TEXT PRIMARY KEY,
    timestamp         TEXT NOT NULL,
    source            TEXT NOT NULL,
    action            TEXT NOT NULL,
    target            TEXT,
    details           TEXT NOT NULL,
    requires_human    INTEGER NOT NULL DEFAULT 0,
    question          TEXT,
    options           TEXT NOT NULL DEFAULT '[]',
    timeout_seconds   INTEGER,
    fallback          TEXT,
    response          TEXT,
    responded_at      TEXT,
    responder         TEXT,
    subscribed_agents TEXT NOT NULL DEFAULT '[]',
    acknowledged_by   TEXT NOT NULL DEFAULT '{}',
    status            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_action ON events(action);
CREATE INDEX IF NOT EXISTS idx_events_source ON events(source);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
";

/// What `publish` hands back to the caller.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub event_id: Uuid,

    /// Subscribers matched at publish time; they poll, nothing is pushed
    pub subscribed_agents: Vec<String>,
}

/// Query filters for [`EventBus::list`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub source: Option<String>,
    pub action: Option<String>,
    pub status: Option<EventStatus>,
    pub limit: Option<usize>,
}

/// Coordination and audit log shared by every component.
pub struct EventBus {
    conn: Mutex<Connection>,
    subs: RwLock<SubscriptionTable>,
    notifier: Option<Notifier>,
}

impl EventBus {
    /// Open (or create) a bus at the given database path.
    pub fn open(path: &Path) -> Result<Self, BusError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory bus; used by tests and ephemeral tooling.
    pub fn in_memory() -> Result<Self, BusError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, BusError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            subs: RwLock::new(SubscriptionTable::new()),
            notifier: None,
        })
    }

    /// Attach the notification collaborator; human-required events get
    /// a fire-and-forget notify on publish.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn subscribe(&self, sub: Subscription) {
        self.subs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(sub);
    }

    /// Drop `agent`'s subscriptions matching `pattern`. Events already
    /// published keep their stamped subscriber set.
    pub fn unsubscribe(&self, agent: &str, pattern: &ActionPattern) {
        self.subs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent, pattern);
    }

    pub fn set_subscriber_enabled(&self, agent: &str, enabled: bool) {
        self.subs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_enabled(agent, enabled);
    }

    /// Publish an event. Durable before returning; fails with
    /// `InvalidEvent` on an empty action.
    pub fn publish(
        &self,
        source: &str,
        action: &str,
        target: Option<&str>,
        details: serde_json::Value,
        human: Option<HumanInteraction>,
    ) -> Result<PublishOutcome, BusError> {
        if action.trim().is_empty() {
            return Err(BusError::InvalidEvent);
        }

        let mut event = Event::new(source, action, target, details);
        if let Some(human) = human {
            event = event.with_human(human);
        }
        event.subscribed_agents = self
            .subs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers_for(action);

        {
            let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            conn.execute(
                "INSERT INTO events (id, timestamp, source, action, target, details,
                     requires_human, question, options, timeout_seconds, fallback,
                     subscribed_agents, acknowledged_by, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    event.id.to_string(),
                    event.timestamp.to_rfc3339(),
                    event.source,
                    event.action,
                    event.target,
                    event.details.to_string(),
                    event.requires_human,
                    event.question,
                    serde_json::to_string(&event.options)?,
                    event.timeout_seconds,
                    event.fallback,
                    serde_json::to_string(&event.subscribed_agents)?,
                    "{}",
                    event.status.as_str(),
                ],
            )?;
        }

        debug!(event_id = %event.id, action, subscribers = event.subscribed_agents.len(), "Event published");

        if event.requires_human {
            if let (Some(notifier), Some(question)) = (&self.notifier, &event.question) {
                notifier.notify(Notification {
                    message: format!("[{}] {}", event.source, question),
                    priority: Priority::High,
                    channel: None,
                });
            }
        }

        Ok(PublishOutcome {
            event_id: event.id,
            subscribed_agents: event.subscribed_agents,
        })
    }

    /// Fetch one event by id.
    pub fn get(&self, event_id: Uuid) -> Result<Event, BusError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare("SELECT * FROM events WHERE id = ?1")?;
        let mut rows = stmt.query(params![event_id.to_string()])?;

        match rows.next()? {
            Some(row) => row_to_event(row),
            None => Err(BusError::NotFound(event_id)),
        }
    }

    /// List events, newest first.
    pub fn list(&self, filter: &EventFilter) -> Result<Vec<Event>, BusError> {
        let mut sql = String::from("SELECT * FROM events WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref source) = filter.source {
            sql.push_str(" AND source = ?");
            args.push(Box::new(source.clone()));
        }
        if let Some(ref action) = filter.action {
            sql.push_str(" AND action = ?");
            args.push(Box::new(action.clone()));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.as_str().to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC, rowid DESC LIMIT ?");
        args.push(Box::new(filter.limit.unwrap_or(50) as i64));

        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let mut rows = stmt.query(&arg_refs[..])?;

        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(row_to_event(row)?);
        }
        Ok(events)
    }

    /// Record that `agent` has seen the event. Repeat calls refresh
    /// the acknowledgment timestamp and never error.
    pub fn acknowledge(&self, event_id: Uuid, agent: &str) -> Result<(), BusError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let acked: String = conn
            .query_row(
                "SELECT acknowledged_by FROM events WHERE id = ?1",
                params![event_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => BusError::NotFound(event_id),
                other => BusError::Storage(other),
            })?;

        let mut map: HashMap<String, DateTime<Utc>> = serde_json::from_str(&acked)?;
        map.insert(agent.to_string(), Utc::now());

        conn.execute(
            "UPDATE events SET acknowledged_by = ?1 WHERE id = ?2",
            params![serde_json::to_string(&map)?, event_id.to_string()],
        )?;
        Ok(())
    }

    /// Record a human response. Fails `NotFound` for unknown events and
    /// `InvalidState` when the event is not human-required or was
    /// already answered. On success the event becomes terminal.
    pub fn respond(
        &self,
        event_id: Uuid,
        response: &str,
        responder: &str,
    ) -> Result<(), BusError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let (requires_human, existing, status): (bool, Option<String>, String) = conn
            .query_row(
                "SELECT requires_human, response, status FROM events WHERE id = ?1",
                params![event_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => BusError::NotFound(event_id),
                other => BusError::Storage(other),
            })?;

        if !requires_human {
            return Err(BusError::InvalidState {
                id: event_id,
                reason: "event does not require a human response".to_string(),
            });
        }
        if existing.is_some() || status != EventStatus::Pending.as_str() {
            return Err(BusError::InvalidState {
                id: event_id,
                reason: "event was already responded to".to_string(),
            });
        }

        conn.execute(
            "UPDATE events
             SET response = ?1, responded_at = ?2, responder = ?3, status = ?4
             WHERE id = ?5",
            params![
                response,
                Utc::now().to_rfc3339(),
                responder,
                EventStatus::Completed.as_str(),
                event_id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Unresolved human-required events, oldest first, annotated with
    /// their computed response deadline.
    pub fn pending_human(&self) -> Result<Vec<PendingHumanEvent>, BusError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT * FROM events
             WHERE requires_human = 1 AND response IS NULL AND status = 'pending'
             ORDER BY timestamp ASC",
        )?;
        let mut rows = stmt.query([])?;

        let mut pending = Vec::new();
        while let Some(row) = rows.next()? {
            let event = row_to_event(row)?;
            let timeout_at = event.timeout_at();
            pending.push(PendingHumanEvent { event, timeout_at });
        }
        Ok(pending)
    }

    /// Storage liveness probe.
    pub fn health_check(&self) -> Result<(), BusError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

/// Column order must match the table definition.
fn row_to_event(row: &rusqlite::Row<'_>) -> Result<Event, BusError> {
    let id: String = row.get("id")?;
    let timestamp: String = row.get("timestamp")?;
    let details: String = row.get("details")?;
    let options: String = row.get("options")?;
    let subscribed: String = row.get("subscribed_agents")?;
    let acked: String = row.get("acknowledged_by")?;
    let responded_at: Option<String> = row.get("responded_at")?;
    let status: String = row.get("status")?;
    let timeout_seconds: Option<i64> = row.get("timeout_seconds")?;

    Ok(Event {
        id: Uuid::parse_str(&id).map_err(|_| BusError::InvalidState {
            id: Uuid::nil(),
            reason: format!("malformed event id '{}'", id),
        })?,
        timestamp: parse_timestamp(&timestamp)?,
        source: row.get("source")?,
        action: row.get("action")?,
        target: row.get("target")?,
        details: serde_json::from_str(&details)?,
        requires_human: row.get("requires_human")?,
        question: row.get("question")?,
        options: serde_json::from_str(&options)?,
        timeout_seconds: timeout_seconds.map(|t| t as u64),
        fallback: row.get("fallback")?,
        response: row.get("response")?,
        responded_at: responded_at.as_deref().map(parse_timestamp).transpose()?,
        responder: row.get("responder")?,
        subscribed_agents: serde_json::from_str(&subscribed)?,
        acknowledged_by: serde_json::from_str(&acked)?,
        status: EventStatus::parse(&status).ok_or_else(|| BusError::InvalidState {
            id: Uuid::nil(),
            reason: format!("unknown event status '{}'", status),
        })?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, BusError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| BusError::InvalidState {
            id: Uuid::nil(),
            reason: format!("malformed timestamp '{}'", raw),
        })
}
