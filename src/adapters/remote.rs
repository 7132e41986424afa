//! Client for the alternate orchestrator runtime.
//!
//! The router fails over to this implementation when the in-process
//! engine is unhealthy. The remote runtime exposes `POST /execute`
//! taking a route request and returning the finished run, `GET
//! /health`, and `GET /registry` listing the agent names it knows.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::core::router::{ChainExecutor, RouteRequest};
use crate::domain::ChainRun;

pub struct RemoteOrchestrator {
    base_url: String,
    client: reqwest::Client,
}

impl RemoteOrchestrator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ChainExecutor for RemoteOrchestrator {
    fn name(&self) -> &str {
        "remote"
    }

    async fn execute(&self, request: RouteRequest) -> Result<ChainRun> {
        let response = self
            .client
            .post(self.url("execute"))
            .json(&request)
            .send()
            .await
            .context("Failed to reach remote orchestrator")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Remote orchestrator rejected execute: {}",
                response.status()
            );
        }

        response
            .json()
            .await
            .context("Failed to parse remote orchestrator run")
    }

    async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url("health"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .context("Remote orchestrator health probe failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Remote orchestrator unhealthy: {}", response.status());
        }
        Ok(())
    }

    async fn known_agents(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.url("registry"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .context("Failed to fetch remote registry")?;

        if !response.status().is_success() {
            anyhow::bail!("Remote registry fetch failed: {}", response.status());
        }

        let mut agents: Vec<String> = response
            .json()
            .await
            .context("Failed to parse remote registry listing")?;
        agents.sort();
        Ok(agents)
    }
}
