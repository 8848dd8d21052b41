//! Object synchronization session: streams the manifest files of a project
//! every time its default branch moves.

use std::collections::HashSet;
use std::sync::Arc;

use agent_relay_core::{AgentToken, FetchError, ProjectInfo, TreeFetcher};
use async_trait::async_trait;
use tonic::Status;
use tracing::{debug, info, info_span, Instrument};

use crate::api::RelayApi;
use crate::config::RelaySettings;
use crate::frames::SyncMessage;
use crate::glob::{decompose, GlobMatcher};
use crate::poll::{connection_deadline, poll_until, PollCondition};
use crate::proto::ObjectsToSynchronizeResponse;
use crate::stream::{StreamContext, StreamSender};
use crate::usage::Counter;
use crate::visitor::{ChunkingVisitor, ObjectsVisitor};

/// Largest `Object` frame sent to an agent.
pub const MANIFEST_MAX_CHUNK_SIZE: usize = 128 * 1024;

const VISIT_FAILED: &str = "GitOps: failed to get objects to synchronize";
const SEND_FAILED: &str = "GitOps: failed to send objects to synchronize";

pub struct ObjectsSession {
    api: Arc<RelayApi>,
    fetcher: Arc<dyn TreeFetcher>,
    settings: RelaySettings,
    sync_count: Counter,
    sender: StreamSender<ObjectsToSynchronizeResponse>,
    ctx: StreamContext,
    token: AgentToken,
    project_id: String,
    paths: Vec<String>,
    last_commit_id: String,
}

impl ObjectsSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<RelayApi>,
        fetcher: Arc<dyn TreeFetcher>,
        settings: RelaySettings,
        sync_count: Counter,
        sender: StreamSender<ObjectsToSynchronizeResponse>,
        token: AgentToken,
        project_id: String,
        paths: Vec<String>,
        last_commit_id: String,
    ) -> Self {
        let ctx = sender.context().clone();
        Self {
            api,
            fetcher,
            settings,
            sync_count,
            sender,
            ctx,
            token,
            project_id,
            paths,
            last_commit_id,
        }
    }

    /// Poll until the connection's deadline or until the stream is
    /// cancelled. A returned `Status` ends the stream with that error.
    pub async fn run(mut self) -> Result<(), Status> {
        let Some(agent_info) = self
            .api
            .get_agent_info(&self.ctx, &self.token, false)
            .await?
        else {
            return Err(Status::unavailable("unavailable"));
        };

        // Repeating a glob selects nothing new; only distinct globs count.
        let mut distinct = HashSet::new();
        self.paths.retain(|glob| distinct.insert(glob.clone()));

        let max_paths = self.settings.max_number_of_paths as usize;
        if self.paths.len() > max_paths {
            return Err(Status::invalid_argument(format!(
                "maximum number of GitOps paths per manifest project is {}, but {} was requested",
                max_paths,
                self.paths.len()
            )));
        }

        let span = info_span!("gitops", agent_id = agent_info.id, project_id = %self.project_id);
        let ctx = self.ctx.clone();
        let interval = self.settings.gitops_poll_period;
        let deadline = connection_deadline(self.settings.max_connection_age);
        poll_until(&ctx, interval, deadline, &mut self)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), Status> {
        self.sender
            .send(msg.into())
            .await
            .map_err(|e| self.api.handle_send_error(SEND_FAILED, &e))
    }

    /// Send one Headers, Objects, Trailers turn for `commit_id`.
    async fn send_turn(&self, project_info: &ProjectInfo, commit_id: &str) -> Result<(), Status> {
        self.send(SyncMessage::Headers {
            commit_id: commit_id.to_string(),
        })
        .await?;

        let mut visitor = ObjectsVisitor::new(&self.sender, self.settings.sync_budget);
        for glob in &self.paths {
            let decomposition = decompose(glob);
            // The prefix narrows the walk; entries are still matched
            // against the whole glob since fetchers report full paths.
            let glob = glob.strip_prefix('/').unwrap_or(glob);
            let matcher = GlobMatcher::new(glob).map_err(|e| self.visit_error(e))?;
            visitor.set_glob(matcher);

            let mut chunking = ChunkingVisitor::new(&mut visitor, MANIFEST_MAX_CHUNK_SIZE);
            self.fetcher
                .visit(
                    &project_info.gitaly_info,
                    &project_info.repository,
                    commit_id,
                    &decomposition.prefix,
                    decomposition.recursive,
                    &mut chunking,
                )
                .await
                .map_err(|e| self.visit_error(e))?;
        }

        self.send(SyncMessage::Trailers).await?;
        info!(
            commit_id,
            number_of_files = visitor.number_of_files(),
            "GitOps: fetched files"
        );
        Ok(())
    }

    fn visit_error(&self, err: FetchError) -> Status {
        match err {
            FetchError::SendFailed(_) => self.api.handle_send_error(SEND_FAILED, &err),
            e if e.is_user_error() => {
                self.api.handle_processing_error(VISIT_FAILED, &e);
                Status::failed_precondition(format!("{}: {}", VISIT_FAILED, e))
            }
            e @ FetchError::Internal(_) => {
                self.api.handle_processing_error(VISIT_FAILED, &e);
                Status::internal(VISIT_FAILED)
            }
            e => {
                self.api.handle_processing_error(VISIT_FAILED, &e);
                Status::unavailable(VISIT_FAILED)
            }
        }
    }
}

#[async_trait]
impl PollCondition for ObjectsSession {
    type Error = Status;

    async fn check(&mut self) -> Result<bool, Status> {
        let Some(project_info) = self
            .api
            .get_project_info(&self.ctx, &self.token, &self.project_id)
            .await?
        else {
            return Ok(false);
        };

        let info = match self
            .fetcher
            .poll(
                &project_info.gitaly_info,
                &project_info.repository,
                &self.last_commit_id,
                "",
            )
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.api
                    .handle_processing_error("GitOps: repository poll failed", &e);
                return Ok(false);
            }
        };
        if !info.update_available {
            debug!(commit_id = %info.commit_id, "GitOps: no updates");
            return Ok(false);
        }

        info!(commit_id = %info.commit_id, "GitOps: new commit");
        self.send_turn(&project_info, &info.commit_id).await?;
        self.sync_count.inc();
        self.last_commit_id = info.commit_id;
        Ok(false)
    }
}
