//! HTTP client for the agent RPC surface.
//!
//! Used by migration to reach the target agent, and by anything else that
//! drives an agent remotely.

use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;
use tracing::{debug, error};

use crate::api::types::{
    CheckpointRequest, CheckpointResponse, CreateRequest, ListResponse, MigrateBody, PushRequest,
    RestoreRequest,
};
use crate::container::Container;
use crate::supervisor::ContainerInfo;

/// Agent API client.
#[derive(Debug, Clone)]
pub struct AgentClient {
    client: reqwest::Client,
    base_url: String,
}

impl AgentClient {
    /// Create a client for the agent at `base_url` (e.g. `http://10.0.0.2:9100`).
    pub fn new(base_url: impl Into<String>) -> Self {
        // Restores pull whole images, so allow long calls.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check the agent is up.
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/healthz", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Health check failed with status: {}", response.status());
        }
        Ok(())
    }

    pub async fn create(&self, container: &Container, update: bool) -> Result<()> {
        let url = format!("{}/v1/containers", self.base_url);
        debug!(container_id = %container.id, update, "Creating container");

        let body = CreateRequest {
            container: container.clone(),
            update,
        };
        let response = self.client.post(&url).json(&body).send().await?;
        check(response, "create container").await
    }

    /// Observed state of a container, `None` if the agent does not have it.
    pub async fn get(&self, id: &str) -> Result<Option<ContainerInfo>> {
        let url = format!("{}/v1/containers/{}", self.base_url, id);
        let response = self.client.get(&url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to get container");
            anyhow::bail!("Failed to get container: {} - {}", status, body);
        }

        Ok(Some(response.json().await?))
    }

    pub async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let url = format!("{}/v1/containers", self.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to list containers");
            anyhow::bail!("Failed to list containers: {} - {}", status, body);
        }

        let list: ListResponse<ContainerInfo> = response.json().await?;
        Ok(list.items)
    }

    pub async fn update(&self, container: &Container) -> Result<()> {
        let url = format!("{}/v1/containers/{}", self.base_url, container.id);
        let response = self.client.put(&url).json(container).send().await?;
        check(response, "update container").await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let url = format!("{}/v1/containers/{}", self.base_url, id);
        let response = self.client.delete(&url).send().await?;
        check(response, "delete container").await
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        self.action(id, "start").await
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        self.action(id, "stop").await
    }

    pub async fn kill(&self, id: &str) -> Result<()> {
        self.action(id, "kill").await
    }

    pub async fn rollback(&self, id: &str) -> Result<()> {
        self.action(id, "rollback").await
    }

    /// Checkpoint a container, returning the checkpoint index digest.
    pub async fn checkpoint(
        &self,
        id: &str,
        reference: &str,
        live: bool,
        exit: bool,
    ) -> Result<String> {
        let url = format!("{}/v1/containers/{}/checkpoint", self.base_url, id);
        let body = CheckpointRequest {
            reference: reference.to_string(),
            live,
            exit,
        };
        let response = self.client.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to checkpoint container");
            anyhow::bail!("Failed to checkpoint container: {} - {}", status, body);
        }

        let checkpoint: CheckpointResponse = response.json().await?;
        Ok(checkpoint.digest)
    }

    pub async fn migrate(&self, id: &str, body: &MigrateBody) -> Result<()> {
        let url = format!("{}/v1/containers/{}/migrate", self.base_url, id);
        let response = self.client.post(&url).json(body).send().await?;
        check(response, "migrate container").await
    }

    pub async fn push(&self, reference: &str) -> Result<()> {
        let url = format!("{}/v1/images/push", self.base_url);
        let body = PushRequest {
            reference: reference.to_string(),
        };
        let response = self.client.post(&url).json(&body).send().await?;
        check(response, "push image").await
    }

    pub async fn restore(&self, reference: &str, live: bool) -> Result<()> {
        let url = format!("{}/v1/restore", self.base_url);
        debug!(reference = %reference, live, "Requesting restore");

        let body = RestoreRequest {
            reference: reference.to_string(),
            live,
        };
        let response = self.client.post(&url).json(&body).send().await?;
        check(response, "restore checkpoint").await
    }

    async fn action(&self, id: &str, action: &str) -> Result<()> {
        let url = format!("{}/v1/containers/{}/{}", self.base_url, id, action);
        let response = self.client.post(&url).send().await?;
        check(response, action).await
    }
}

async fn check(response: reqwest::Response, what: &str) -> Result<()> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, operation = what, "Agent request failed");
        anyhow::bail!("Failed to {}: {} - {}", what, status, body);
    }
    Ok(())
}
