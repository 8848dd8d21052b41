//! Fakes shared by the unit tests of this crate.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay_core::{
    AgentInfo, AgentToken, FetchError, FetchVisitor, GitalyInfo, MetadataClient, MetadataError,
    PollInfo, ProjectInfo, Repository, TreeFetcher,
};
use async_trait::async_trait;

use crate::api::{CacheSettings, ErrorTracker, RelayApi};
use crate::glob::REPOSITORY_ROOT;

/// Error tracker remembering every capture as `"<msg>: <err>"`.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracker {
    captured: Arc<Mutex<Vec<String>>>,
}

impl RecordingTracker {
    pub fn captured(&self) -> Vec<String> {
        self.captured.lock().unwrap().clone()
    }
}

impl ErrorTracker for RecordingTracker {
    fn capture(&self, msg: &str, err: &dyn Display) {
        self.captured.lock().unwrap().push(format!("{}: {}", msg, err));
    }
}

pub fn sample_repository() -> Repository {
    Repository {
        storage_name: "default".to_string(),
        relative_path: "group/project.git".to_string(),
        gl_repository: "project-1".to_string(),
        gl_project_path: "group/project".to_string(),
    }
}

pub fn sample_agent_info() -> AgentInfo {
    AgentInfo {
        id: 7,
        project_id: 1,
        name: "my-agent".to_string(),
        gitaly_info: GitalyInfo {
            address: "tcp://gitaly:8075".to_string(),
            token: "gitaly-token".to_string(),
            features: HashMap::new(),
        },
        repository: sample_repository(),
    }
}

pub fn sample_project_info() -> ProjectInfo {
    let agent = sample_agent_info();
    ProjectInfo {
        project_id: 2,
        gitaly_info: agent.gitaly_info,
        repository: Repository {
            relative_path: "group/manifests.git".to_string(),
            gl_repository: "project-2".to_string(),
            gl_project_path: "group/manifests".to_string(),
            ..agent.repository
        },
    }
}

/// Metadata client answering with configurable results and counting calls.
pub struct FakeMetadataClient {
    agent_info: Mutex<Result<AgentInfo, MetadataError>>,
    project_info: Mutex<Result<ProjectInfo, MetadataError>>,
    agent_info_calls: AtomicUsize,
    project_info_calls: AtomicUsize,
}

impl Default for FakeMetadataClient {
    fn default() -> Self {
        Self {
            agent_info: Mutex::new(Ok(sample_agent_info())),
            project_info: Mutex::new(Ok(sample_project_info())),
            agent_info_calls: AtomicUsize::new(0),
            project_info_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeMetadataClient {
    pub fn set_agent_info(&self, result: Result<AgentInfo, MetadataError>) {
        *self.agent_info.lock().unwrap() = result;
    }

    pub fn set_project_info(&self, result: Result<ProjectInfo, MetadataError>) {
        *self.project_info.lock().unwrap() = result;
    }

    pub fn agent_info_calls(&self) -> usize {
        self.agent_info_calls.load(Ordering::SeqCst)
    }

    pub fn project_info_calls(&self) -> usize {
        self.project_info_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataClient for FakeMetadataClient {
    async fn get_agent_info(&self, _token: &AgentToken) -> Result<AgentInfo, MetadataError> {
        self.agent_info_calls.fetch_add(1, Ordering::SeqCst);
        self.agent_info.lock().unwrap().clone()
    }

    async fn get_project_info(
        &self,
        _token: &AgentToken,
        _project_id: &str,
    ) -> Result<ProjectInfo, MetadataError> {
        self.project_info_calls.fetch_add(1, Ordering::SeqCst);
        self.project_info.lock().unwrap().clone()
    }
}

/// Default cache settings: 300s for values, 60s for errors.
pub fn cache_settings() -> CacheSettings {
    CacheSettings {
        ttl: Duration::from_secs(300),
        error_ttl: Duration::from_secs(60),
    }
}

pub fn api_for(
    metadata: Arc<FakeMetadataClient>,
    tracker: RecordingTracker,
) -> (RelayApi, RecordingTracker) {
    let api = RelayApi::new(
        metadata,
        Arc::new(tracker.clone()),
        cache_settings(),
        cache_settings(),
    );
    (api, tracker)
}

pub fn api_with(tracker: RecordingTracker) -> (RelayApi, RecordingTracker) {
    api_for(Arc::new(FakeMetadataClient::default()), tracker)
}

/// In-memory repository: one current commit per fake, each commit a sorted
/// map of repository-relative paths to contents.
#[derive(Default)]
pub struct FakeTreeFetcher {
    head: Mutex<Option<String>>,
    trees: Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    poll_error: Mutex<Option<FetchError>>,
    polls: AtomicUsize,
}

impl FakeTreeFetcher {
    /// Add a commit and make it the head of the default branch.
    pub fn commit(&self, commit_id: &str, files: &[(&str, &str)]) {
        let tree = files
            .iter()
            .map(|(path, data)| (path.to_string(), data.as_bytes().to_vec()))
            .collect();
        self.trees.lock().unwrap().insert(commit_id.to_string(), tree);
        *self.head.lock().unwrap() = Some(commit_id.to_string());
    }

    /// Fail the next poll with `err`.
    pub fn fail_next_poll(&self, err: FetchError) {
        *self.poll_error.lock().unwrap() = Some(err);
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    fn tree(&self, revision: &str) -> Result<BTreeMap<String, Vec<u8>>, FetchError> {
        self.trees
            .lock()
            .unwrap()
            .get(revision)
            .cloned()
            .ok_or_else(|| FetchError::RefNotFound(revision.to_string()))
    }
}

fn under_prefix<'p>(path: &'p str, prefix: &str) -> Option<&'p str> {
    if prefix == REPOSITORY_ROOT {
        return Some(path);
    }
    path.strip_prefix(prefix)?.strip_prefix('/')
}

#[async_trait]
impl TreeFetcher for FakeTreeFetcher {
    async fn poll(
        &self,
        _gitaly_info: &GitalyInfo,
        _repo: &Repository,
        last_commit_id: &str,
        ref_name: &str,
    ) -> Result<PollInfo, FetchError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.poll_error.lock().unwrap().take() {
            return Err(err);
        }
        let head = self.head.lock().unwrap().clone();
        match head {
            Some(commit_id) => Ok(PollInfo {
                update_available: commit_id != last_commit_id,
                commit_id,
            }),
            None if ref_name.is_empty() => Err(FetchError::DefaultBranchNotFound),
            None => Err(FetchError::RefNotFound(ref_name.to_string())),
        }
    }

    async fn visit(
        &self,
        _gitaly_info: &GitalyInfo,
        _repo: &Repository,
        revision: &str,
        prefix: &str,
        recursive: bool,
        visitor: &mut dyn FetchVisitor,
    ) -> Result<(), FetchError> {
        for (path, data) in self.tree(revision)? {
            let Some(rest) = under_prefix(&path, prefix) else {
                continue;
            };
            if !recursive && rest.contains('/') {
                continue;
            }
            let decision = visitor.entry(&path)?;
            if !decision.download {
                continue;
            }
            if data.len() as i64 > decision.max_size {
                return Err(FetchError::FileTooBig {
                    path,
                    size: data.len() as u64,
                    max_size: decision.max_size,
                });
            }
            if visitor.stream_chunk(&path, &data).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn fetch_file(
        &self,
        _gitaly_info: &GitalyInfo,
        _repo: &Repository,
        revision: &str,
        path: &str,
        max_size: i64,
    ) -> Result<Option<Vec<u8>>, FetchError> {
        let Some(data) = self.tree(revision)?.remove(path) else {
            return Ok(None);
        };
        if data.len() as i64 > max_size {
            return Err(FetchError::FileTooBig {
                path: path.to_string(),
                size: data.len() as u64,
                max_size,
            });
        }
        Ok(Some(data))
    }
}
