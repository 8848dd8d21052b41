//! HTTP client for the repository-hosting backend's internal API.

use agent_relay_core::{
    AgentInfo, AgentToken, GitalyInfo, MetadataClient, MetadataError, ProjectInfo, Repository,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::usage::{UsageData, UsageSink};

const AGENT_INFO_API_PATH: &str = "/api/v4/internal/kubernetes/agent_info";
const PROJECT_INFO_API_PATH: &str = "/api/v4/internal/kubernetes/project_info";
const USAGE_METRICS_API_PATH: &str = "/api/v4/internal/kubernetes/usage_metrics";

#[derive(Deserialize)]
struct GetAgentInfoResponse {
    project_id: i64,
    agent_id: i64,
    agent_name: String,
    gitaly_info: GitalyInfo,
    gitaly_repository: Repository,
}

#[derive(Deserialize)]
struct GetProjectInfoResponse {
    project_id: i64,
    gitaly_info: GitalyInfo,
    gitaly_repository: Repository,
}

/// Metadata and usage client authenticating with the agent's token.
pub struct GitLabClient {
    http: Client,
    base_url: String,
}

impl GitLabClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn do_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, MetadataError> {
        let response = request.send().await.map_err(transport_error)?;
        let response = check_status(response).await?;
        response.json::<T>().await.map_err(transport_error)
    }
}

#[async_trait]
impl MetadataClient for GitLabClient {
    async fn get_agent_info(&self, token: &AgentToken) -> Result<AgentInfo, MetadataError> {
        let request = self
            .http
            .get(self.url(AGENT_INFO_API_PATH))
            .bearer_auth(token.as_str());
        let response: GetAgentInfoResponse = self.do_json(request).await?;
        Ok(AgentInfo {
            id: response.agent_id,
            project_id: response.project_id,
            name: response.agent_name,
            gitaly_info: response.gitaly_info,
            repository: response.gitaly_repository,
        })
    }

    async fn get_project_info(
        &self,
        token: &AgentToken,
        project_id: &str,
    ) -> Result<ProjectInfo, MetadataError> {
        let request = self
            .http
            .get(self.url(PROJECT_INFO_API_PATH))
            .query(&[("id", project_id)])
            .bearer_auth(token.as_str());
        let response: GetProjectInfoResponse = self.do_json(request).await?;
        Ok(ProjectInfo {
            project_id: response.project_id,
            gitaly_info: response.gitaly_info,
            repository: response.gitaly_repository,
        })
    }
}

#[async_trait]
impl UsageSink for GitLabClient {
    async fn send_usage(&self, data: &UsageData) -> Result<(), MetadataError> {
        let response = self
            .http
            .post(self.url(USAGE_METRICS_API_PATH))
            .json(data)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, MetadataError> {
    let status = response.status();
    match status {
        s if s.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED => Err(MetadataError::Unauthorized),
        StatusCode::FORBIDDEN => Err(MetadataError::Forbidden),
        _ => {
            let body = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "Metadata API request failed: {}", body);
            Err(MetadataError::Other {
                status: Some(status.as_u16()),
                message: format!("unexpected status code {}", status),
            })
        }
    }
}

fn transport_error(err: reqwest::Error) -> MetadataError {
    MetadataError::other(err.to_string())
}
