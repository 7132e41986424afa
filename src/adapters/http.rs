//! HTTP client for agent action endpoints.
//!
//! Agents expose `POST {location}/actions/{action}` accepting a JSON
//! parameter object and `GET {location}/health` for probes. A success
//! body is the payload itself, optionally carrying a top-level
//! `cost_usd` figure; an error body is
//! `{"error": "...", "retryable": bool, "cost_usd": ...}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{AgentClient, AgentReply};
use crate::core::registry::AgentDescriptor;
use crate::error::CallError;

/// Structured error agents return on failure.
#[derive(Debug, Deserialize)]
struct AgentErrorBody {
    error: Option<String>,
    retryable: Option<bool>,
    cost_usd: Option<f64>,
}

pub struct HttpAgentClient {
    client: reqwest::Client,
}

impl Default for HttpAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAgentClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn action_url(location: &str, action: &str) -> String {
        format!("{}/actions/{}", location.trim_end_matches('/'), action)
    }

    fn health_url(location: &str) -> String {
        format!("{}/health", location.trim_end_matches('/'))
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn call(
        &self,
        agent: &AgentDescriptor,
        action: &str,
        params: &serde_json::Value,
        timeout: Duration,
    ) -> Result<AgentReply, CallError> {
        let url = Self::action_url(&agent.location, action);

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CallError::Timeout {
                        agent: agent.name.clone(),
                        action: action.to_string(),
                        timeout,
                    }
                } else {
                    CallError::Transport {
                        agent: agent.name.clone(),
                        action: action.to_string(),
                        source: e,
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body: AgentErrorBody = response.json().await.unwrap_or(AgentErrorBody {
                error: None,
                retryable: None,
                cost_usd: None,
            });
            return Err(CallError::Agent {
                agent: agent.name.clone(),
                action: action.to_string(),
                status: status.as_u16(),
                message: body.error.unwrap_or_else(|| "agent reported failure".to_string()),
                // Server-side trouble is worth retrying; a rejected
                // request is not, unless the agent says otherwise
                retryable: body.retryable.unwrap_or(status.is_server_error()),
                cost_usd: body.cost_usd,
            });
        }

        let payload: serde_json::Value =
            response.json().await.map_err(|e| CallError::Transport {
                agent: agent.name.clone(),
                action: action.to_string(),
                source: e,
            })?;

        let cost_usd = payload.get("cost_usd").and_then(serde_json::Value::as_f64);
        Ok(AgentReply { payload, cost_usd })
    }

    async fn probe(&self, location: &str) -> Result<(), CallError> {
        let url = Self::health_url(location);

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| CallError::Transport {
                agent: location.to_string(),
                action: "health".to_string(),
                source: e,
            })?;

        if !response.status().is_success() {
            return Err(CallError::Agent {
                agent: location.to_string(),
                action: "health".to_string(),
                status: response.status().as_u16(),
                message: "health probe failed".to_string(),
                retryable: true,
                cost_usd: None,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_url() {
        assert_eq!(
            HttpAgentClient::action_url("http://localhost:9101/", "quote"),
            "http://localhost:9101/actions/quote"
        );
        assert_eq!(
            HttpAgentClient::action_url("http://localhost:9101", "quote"),
            "http://localhost:9101/actions/quote"
        );
    }

    #[test]
    fn test_health_url() {
        assert_eq!(
            HttpAgentClient::health_url("http://localhost:9101"),
            "http://localhost:9101/health"
        );
    }
}
