//! Request and response bodies shared by the router and [`AgentClient`].
//!
//! [`AgentClient`]: crate::client::AgentClient

use serde::{Deserialize, Serialize};

use crate::container::Container;

/// POST /v1/containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub container: Container,
    /// Update the container if it already exists.
    #[serde(default)]
    pub update: bool,
}

/// POST /v1/containers/{id}/checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub reference: String,
    #[serde(default)]
    pub live: bool,
    /// Stop the container once checkpointed.
    #[serde(default)]
    pub exit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointResponse {
    /// Digest of the checkpoint index.
    pub digest: String,
}

/// POST /v1/containers/{id}/migrate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateBody {
    /// Address of the target agent.
    pub to: String,
    pub reference: String,
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub delete: bool,
}

/// POST /v1/images/push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub reference: String,
}

/// POST /v1/restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub reference: String,
    #[serde(default)]
    pub live: bool,
}

/// GET /v1/containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}
