//! Fire-and-forget notification collaborator.
//!
//! Notifications go through an explicit outbound queue drained by a
//! spawned task, never an inline blocking call, so an unavailable
//! collaborator cannot stall a chain step. Delivery failures are
//! logged and dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A "notify a human" request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,

    pub priority: Priority,

    /// Delivery channel hint (e.g. "slack", "sms"); collaborator picks
    /// a default when absent
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Handle to the outbound notification queue.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    /// Spawn the queue worker. With no endpoint configured,
    /// notifications are logged and dropped.
    pub fn spawn(endpoint: Option<String>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();

        tokio::spawn(async move {
            let client = reqwest::Client::new();
            while let Some(notification) = rx.recv().await {
                let Some(ref url) = endpoint else {
                    debug!(message = %notification.message, "No notify endpoint; dropping notification");
                    continue;
                };

                match client.post(url).json(&notification).send().await {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => {
                        warn!(status = %response.status(), "Notification collaborator rejected notify");
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to reach notification collaborator");
                    }
                }
            }
        });

        Self { tx }
    }

    /// Enqueue a notification; never blocks, never fails the caller.
    pub fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            warn!("Notification worker is gone; dropping notification");
        }
    }
}
