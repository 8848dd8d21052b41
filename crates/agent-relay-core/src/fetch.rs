use async_trait::async_trait;

use crate::api::{GitalyInfo, PollInfo, Repository};

/// Errors from polling or walking a repository tree.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("path not found: {path}")]
    NotFound { path: String },

    #[error("file {path} is too big: {size} bytes, limit {max_size} bytes")]
    FileTooBig {
        path: String,
        size: u64,
        max_size: i64,
    },

    #[error("unexpected tree entry type at {path}")]
    UnexpectedTreeEntryType { path: String },

    #[error("glob {glob} match failed: {reason}")]
    GlobMatchFailed { glob: String, reason: String },

    #[error("maximum number of manifest files limit reached: {0}")]
    MaxNumberOfFiles(u32),

    #[error("path visited more than once: {path}")]
    DuplicatePath { path: String },

    #[error("ref {0:?} not found")]
    RefNotFound(String),

    #[error("default branch not found")]
    DefaultBranchNotFound,

    #[error("stream send failed: {0}")]
    SendFailed(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl FetchError {
    /// Errors caused by the repository contents or the user's request rather
    /// than by the relay or its backends.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::FileTooBig { .. }
                | Self::UnexpectedTreeEntryType { .. }
                | Self::GlobMatchFailed { .. }
                | Self::MaxNumberOfFiles(_)
                | Self::DuplicatePath { .. }
        )
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Answer of a visitor for a single tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryDecision {
    pub download: bool,
    /// Largest file the visitor accepts for this entry; only meaningful when downloading
    pub max_size: i64,
}

impl EntryDecision {
    pub const SKIP: Self = Self {
        download: false,
        max_size: 0,
    };

    pub fn download(max_size: i64) -> Self {
        Self {
            download: true,
            max_size,
        }
    }
}

/// Callbacks a `TreeFetcher` drives while walking a tree.
///
/// The fetcher calls `entry` once per file. If the visitor asks for the file,
/// its contents follow as one or more `stream_chunk` calls, never more than
/// `max_size` bytes in total.
#[async_trait]
pub trait FetchVisitor: Send {
    fn entry(&mut self, path: &str) -> Result<EntryDecision, FetchError>;

    /// Returns `true` to stop the walk early.
    async fn stream_chunk(&mut self, path: &str, data: &[u8]) -> Result<bool, FetchError>;
}

/// Read access to repositories hosted by the backend.
#[async_trait]
pub trait TreeFetcher: Send + Sync {
    /// Resolve `ref_name` (empty for the default branch) and compare it with
    /// `last_commit_id`.
    async fn poll(
        &self,
        gitaly_info: &GitalyInfo,
        repo: &Repository,
        last_commit_id: &str,
        ref_name: &str,
    ) -> Result<PollInfo, FetchError>;

    /// Walk the files under `prefix` at `revision`, descending into
    /// subdirectories only if `recursive` is set.
    ///
    /// # Arguments
    /// * `revision` - Commit id to read from
    /// * `prefix` - Repository-relative directory, `.` for the root
    /// * `recursive` - Whether nested directories are visited
    /// * `visitor` - Receives entries and file data
    async fn visit(
        &self,
        gitaly_info: &GitalyInfo,
        repo: &Repository,
        revision: &str,
        prefix: &str,
        recursive: bool,
        visitor: &mut dyn FetchVisitor,
    ) -> Result<(), FetchError>;

    /// Read one file at `revision`. `Ok(None)` means the file does not exist.
    async fn fetch_file(
        &self,
        gitaly_info: &GitalyInfo,
        repo: &Repository,
        revision: &str,
        path: &str,
        max_size: i64,
    ) -> Result<Option<Vec<u8>>, FetchError>;
}
