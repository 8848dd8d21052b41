use async_trait::async_trait;

use crate::api::{AgentInfo, AgentToken, ProjectInfo};

/// Errors from the metadata API.
///
/// `Clone` so a failed lookup can be cached and replayed to later callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("metadata API error (status {status:?}): {message}")]
    Other {
        status: Option<u16>,
        message: String,
    },

    #[error("request cancelled")]
    Cancelled,
}

impl MetadataError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Other { status: Some(s), .. } if (500..600).contains(s))
    }
}

/// Looks up agent and project metadata on behalf of an agent.
///
/// Every call authenticates with the agent's own token, so each successful
/// lookup also proves the token is still valid.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn get_agent_info(&self, token: &AgentToken) -> Result<AgentInfo, MetadataError>;

    /// # Arguments
    /// * `token` - Agent token
    /// * `project_id` - Numeric id or full path of the manifest project
    async fn get_project_info(
        &self,
        token: &AgentToken,
        project_id: &str,
    ) -> Result<ProjectInfo, MetadataError>;
}
