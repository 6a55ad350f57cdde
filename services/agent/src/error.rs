//! Error types for supervisor operations.

use thiserror::Error;

use crate::network::NetworkError;
use crate::runtime::RuntimeError;
use crate::state::StoreError;

/// Result type for supervisor operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors surfaced by lifecycle, checkpoint and migration operations.
///
/// Lower-layer failures are never retried here; they are wrapped with the
/// name of the stage that failed and handed back to the caller.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Empty container identifier.
    #[error("container id must not be empty")]
    NoId,

    /// Empty image or checkpoint reference.
    #[error("reference must not be empty")]
    NoRef,

    /// Create without update against an existing container.
    #[error("container {0} already exists")]
    AlreadyExists(String),

    /// Container does not exist on this agent.
    #[error("container {0} not found")]
    NotFound(String),

    /// Migration destination already has a container with this id.
    #[error("container {0} already exists on the migration target")]
    ServiceExistsOnTarget(String),

    /// Request or stored configuration is malformed.
    #[error("invalid container config: {0}")]
    InvalidConfig(String),

    /// A dependency failed during the named stage.
    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: StageError,
    },
}

/// The lower-layer error wrapped by [`AgentError::Stage`].
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Format(#[from] berth_checkpoint_format::FormatError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("detached task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Remote(String),
}

impl AgentError {
    /// Wrap a lower-layer error with the stage that produced it.
    pub fn stage(stage: &'static str, source: impl Into<StageError>) -> Self {
        Self::Stage {
            stage,
            source: source.into(),
        }
    }

    /// Returns true for validation errors (nothing was attempted).
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::NoId | Self::NoRef | Self::InvalidConfig(_))
    }

    /// Returns true for conflicts with existing state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyExists(_) | Self::ServiceExistsOnTarget(_))
    }

    /// Returns true if the container (or its task) does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Stage {
                source: StageError::Runtime(e),
                ..
            } => e.is_not_found(),
            _ => false,
        }
    }

    /// Stage label for dependency failures.
    pub fn stage_name(&self) -> Option<&'static str> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Attach a stage label to a fallible lower-layer call.
pub(crate) trait StageExt<T> {
    fn stage(self, stage: &'static str) -> AgentResult<T>;
}

impl<T, E: Into<StageError>> StageExt<T> for Result<T, E> {
    fn stage(self, stage: &'static str) -> AgentResult<T> {
        self.map_err(|e| AgentError::stage(stage, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_message_includes_stage() {
        let err = AgentError::stage(
            "create new container task",
            RuntimeError::Unavailable("socket closed".to_string()),
        );
        assert_eq!(err.stage_name(), Some("create new container task"));
        assert!(err.to_string().starts_with("create new container task: "));
        assert!(err.to_string().contains("socket closed"));
    }

    #[test]
    fn test_classification() {
        assert!(AgentError::NoId.is_validation());
        assert!(AgentError::NoRef.is_validation());
        assert!(AgentError::AlreadyExists("web".into()).is_conflict());
        assert!(AgentError::ServiceExistsOnTarget("web".into()).is_conflict());
        assert!(AgentError::NotFound("web".into()).is_not_found());

        let wrapped: AgentResult<()> =
            Err(RuntimeError::NotFound("task web".to_string())).stage("load task");
        assert!(wrapped.unwrap_err().is_not_found());
    }
}
