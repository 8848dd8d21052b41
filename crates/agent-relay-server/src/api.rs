//! Server-side helpers shared by the streaming sessions: cached metadata
//! lookups and the mapping of failures to log levels and gRPC statuses.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use agent_relay_core::{AgentInfo, AgentToken, FetchError, MetadataClient, MetadataError, ProjectInfo};
use tonic::Status;
use tracing::{debug, error, info};

use crate::cache::ExpiringCache;
use crate::stream::StreamContext;

/// Collects unexpected errors for later inspection.
pub trait ErrorTracker: Send + Sync {
    fn capture(&self, msg: &str, err: &dyn Display);
}

/// Emits captured errors as `error_tracking` events.
#[derive(Debug, Default)]
pub struct TracingErrorTracker;

impl ErrorTracker for TracingErrorTracker {
    fn capture(&self, msg: &str, err: &dyn Display) {
        error!(target: "error_tracking", error = %err, "{}", msg);
    }
}

/// Classification of errors that end up in `handle_processing_error`.
pub trait ProcessingError: Display {
    /// Caused by the user's repository or request; logged, never captured.
    fn is_user_error(&self) -> bool;

    /// Caused by the caller going away; not worth logging.
    fn is_cancellation(&self) -> bool {
        false
    }
}

impl ProcessingError for FetchError {
    fn is_user_error(&self) -> bool {
        FetchError::is_user_error(self)
    }
}

impl ProcessingError for MetadataError {
    fn is_user_error(&self) -> bool {
        false
    }

    fn is_cancellation(&self) -> bool {
        matches!(self, MetadataError::Cancelled)
    }
}

/// TTLs of one metadata cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub error_ttl: Duration,
}

pub struct RelayApi {
    metadata: Arc<dyn MetadataClient>,
    error_tracker: Arc<dyn ErrorTracker>,
    agent_info_cache: ExpiringCache<AgentToken, AgentInfo, MetadataError>,
    project_info_cache: ExpiringCache<(AgentToken, String), ProjectInfo, MetadataError>,
}

impl RelayApi {
    pub fn new(
        metadata: Arc<dyn MetadataClient>,
        error_tracker: Arc<dyn ErrorTracker>,
        agent_info: CacheSettings,
        project_info: CacheSettings,
    ) -> Self {
        Self {
            metadata,
            error_tracker,
            agent_info_cache: ExpiringCache::new(agent_info.ttl, agent_info.error_ttl),
            project_info_cache: ExpiringCache::new(project_info.ttl, project_info.error_ttl),
        }
    }

    /// Look up the agent owning `token`, through the cache.
    ///
    /// Returns `Ok(None)` for an unexpected failure when
    /// `no_error_on_unknown_error` is set, so a polling caller can try again
    /// on its next tick. Credential failures are always returned as errors.
    pub async fn get_agent_info(
        &self,
        ctx: &StreamContext,
        token: &AgentToken,
        no_error_on_unknown_error: bool,
    ) -> Result<Option<AgentInfo>, Status> {
        let result = self
            .agent_info_cache
            .get(token.clone(), ctx.cancelled(), || {
                self.metadata.get_agent_info(token)
            })
            .await;

        match result {
            Ok(agent_info) => Ok(Some(agent_info)),
            Err(e) => match credential_status(&e) {
                Some(status) => Err(status),
                None => {
                    self.log_and_capture("GetAgentInfo()", &e);
                    if no_error_on_unknown_error {
                        Ok(None)
                    } else {
                        Err(Status::unavailable("unavailable"))
                    }
                }
            },
        }
    }

    /// Look up a manifest project on behalf of the agent, through the cache.
    ///
    /// `Ok(None)` means the lookup failed for an unexpected reason and the
    /// caller should try again later.
    pub async fn get_project_info(
        &self,
        ctx: &StreamContext,
        token: &AgentToken,
        project_id: &str,
    ) -> Result<Option<ProjectInfo>, Status> {
        let key = (token.clone(), project_id.to_string());
        let result = self
            .project_info_cache
            .get(key, ctx.cancelled(), || {
                self.metadata.get_project_info(token, project_id)
            })
            .await;

        match result {
            Ok(project_info) => Ok(Some(project_info)),
            Err(e) => match credential_status(&e) {
                Some(status) => Err(status),
                None => {
                    self.log_and_capture("GetProjectInfo()", &e);
                    Ok(None)
                }
            },
        }
    }

    pub fn handle_processing_error<E: ProcessingError>(&self, msg: &str, err: &E) {
        if err.is_cancellation() {
            return;
        }
        if err.is_user_error() {
            info!(error = %err, "{}", msg);
        } else {
            self.log_and_capture(msg, err);
        }
    }

    /// A failed send almost always means the agent disconnected.
    pub fn handle_send_error(&self, msg: &str, err: &dyn Display) -> Status {
        debug!(error = %err, "{}", msg);
        Status::unavailable("gRPC send failed")
    }

    pub fn log_and_capture(&self, msg: &str, err: &dyn Display) {
        error!(error = %err, "{}", msg);
        self.error_tracker.capture(msg, err);
    }

    /// Sweep both metadata caches until `ctx` is cancelled.
    pub async fn run(&self, ctx: &StreamContext) {
        tokio::join!(
            self.agent_info_cache.run_eviction("agent info", ctx),
            self.project_info_cache.run_eviction("project info", ctx),
        );
    }
}

/// Status for errors that must end the stream regardless of the caller.
fn credential_status(err: &MetadataError) -> Option<Status> {
    match err {
        MetadataError::Cancelled => Some(Status::unavailable("unavailable")),
        MetadataError::Forbidden => Some(Status::permission_denied("forbidden")),
        MetadataError::Unauthorized => Some(Status::unauthenticated("unauthenticated")),
        MetadataError::Other { .. } => None,
    }
}
