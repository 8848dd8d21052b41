use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Credential an agent presents on every call.
///
/// Used as a cache key. `Debug` prints a fingerprint, never the secret.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AgentToken(String);

impl AgentToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short SHA-256 fingerprint, safe to put in logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for AgentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentToken({})", self.fingerprint())
    }
}

/// Address of the repository storage service holding a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitalyInfo {
    pub address: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub features: HashMap<String, String>,
}

/// Location of a repository within its storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub storage_name: String,
    pub relative_path: String,
    #[serde(default)]
    pub gl_repository: String,
    #[serde(default)]
    pub gl_project_path: String,
}

/// What the backend knows about the agent owning a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: i64,
    /// Project holding the agent's configuration
    pub project_id: i64,
    pub name: String,
    pub gitaly_info: GitalyInfo,
    pub repository: Repository,
}

/// A manifest project the agent is allowed to read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub project_id: i64,
    pub gitaly_info: GitalyInfo,
    pub repository: Repository,
}

/// Result of polling a ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollInfo {
    /// The ref points at a commit other than the last processed one
    pub update_available: bool,
    pub commit_id: String,
}
