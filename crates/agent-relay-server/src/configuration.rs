//! Configuration session: streams the agent's configuration file every time
//! it changes on the agent project's default branch.

use std::sync::Arc;

use agent_relay_core::{AgentInfo, AgentToken, FetchError, TreeFetcher};
use async_trait::async_trait;
use tonic::Status;
use tracing::{debug, info, info_span, Instrument};

use crate::agentcfg::{agent_config_path, parse_configuration, ConfigError};
use crate::api::{ProcessingError, RelayApi};
use crate::config::RelaySettings;
use crate::poll::{connection_deadline, poll_until, PollCondition};
use crate::proto::{AgentConfiguration, ConfigurationResponse};
use crate::stream::{StreamContext, StreamSender};

#[derive(Debug, thiserror::Error)]
enum FetchConfigError {
    #[error("agent configuration file: {0}")]
    File(#[from] FetchError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProcessingError for FetchConfigError {
    fn is_user_error(&self) -> bool {
        match self {
            Self::File(e) => e.is_user_error(),
            Self::Config(e) => e.is_user_error(),
        }
    }
}

pub struct ConfigurationSession {
    api: Arc<RelayApi>,
    fetcher: Arc<dyn TreeFetcher>,
    settings: RelaySettings,
    sender: StreamSender<ConfigurationResponse>,
    ctx: StreamContext,
    token: AgentToken,
    last_commit_id: String,
}

impl ConfigurationSession {
    pub fn new(
        api: Arc<RelayApi>,
        fetcher: Arc<dyn TreeFetcher>,
        settings: RelaySettings,
        sender: StreamSender<ConfigurationResponse>,
        token: AgentToken,
        last_commit_id: String,
    ) -> Self {
        let ctx = sender.context().clone();
        Self {
            api,
            fetcher,
            settings,
            sender,
            ctx,
            token,
            last_commit_id,
        }
    }

    pub async fn run(mut self) -> Result<(), Status> {
        let span = info_span!("agent_configuration", token = %self.token.fingerprint());
        let ctx = self.ctx.clone();
        let interval = self.settings.agent_config_poll_period;
        let deadline = connection_deadline(self.settings.max_connection_age);
        poll_until(&ctx, interval, deadline, &mut self)
            .instrument(span)
            .await?;
        Ok(())
    }

    async fn fetch_configuration(
        &self,
        agent_info: &AgentInfo,
        commit_id: &str,
    ) -> Result<AgentConfiguration, FetchConfigError> {
        let path = agent_config_path(&agent_info.name);
        let data = self
            .fetcher
            .fetch_file(
                &agent_info.gitaly_info,
                &agent_info.repository,
                commit_id,
                &path,
                self.settings.max_configuration_file_size,
            )
            .await?
            .ok_or(FetchError::NotFound { path })?;
        Ok(parse_configuration(&data)?)
    }
}

#[async_trait]
impl PollCondition for ConfigurationSession {
    type Error = Status;

    async fn check(&mut self) -> Result<bool, Status> {
        // Looked up on every tick: this notices a revoked token and a
        // repository that moved.
        let Some(agent_info) = self
            .api
            .get_agent_info(&self.ctx, &self.token, true)
            .await?
        else {
            return Ok(false);
        };
        let agent_id = agent_info.id;

        let info = match self
            .fetcher
            .poll(
                &agent_info.gitaly_info,
                &agent_info.repository,
                &self.last_commit_id,
                "",
            )
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.api
                    .handle_processing_error("Config: repository poll failed", &e);
                return Ok(false);
            }
        };
        if !info.update_available {
            debug!(agent_id, commit_id = %self.last_commit_id, "Config: no updates");
            return Ok(false);
        }

        info!(agent_id, commit_id = %info.commit_id, "Config: new commit");
        let configuration = match self.fetch_configuration(&agent_info, &info.commit_id).await {
            Ok(configuration) => configuration,
            Err(e) => {
                self.api.handle_processing_error("Config: failed to fetch", &e);
                if e.is_user_error() {
                    // Wait for a commit that fixes the file.
                    self.last_commit_id = info.commit_id;
                }
                return Ok(false);
            }
        };

        let response = ConfigurationResponse {
            configuration: Some(configuration),
            commit_id: info.commit_id.clone(),
        };
        if let Err(e) = self.sender.send(response).await {
            return Err(self.api.handle_send_error("Config: failed to send config", &e));
        }
        self.last_commit_id = info.commit_id;
        Ok(false)
    }
}
