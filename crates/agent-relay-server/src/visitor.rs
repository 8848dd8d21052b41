//! Budgeted visitor streaming manifest files to an agent.

use std::collections::HashSet;

use agent_relay_core::{EntryDecision, FetchError, FetchVisitor};
use async_trait::async_trait;

use crate::frames::SyncMessage;
use crate::glob::GlobMatcher;
use crate::proto::ObjectsToSynchronizeResponse;
use crate::stream::StreamSender;

/// Limits applied to one synchronization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncBudget {
    pub max_total_file_size: i64,
    pub max_file_size: i64,
    pub max_number_of_files: u32,
}

/// Selects entries matching the current glob and forwards their data as
/// `Object` frames, within a `SyncBudget`.
///
/// The budget spans every glob visited with the same instance, and so does
/// the set of selected paths: a path selected by two globs is an error.
pub struct ObjectsVisitor<'a> {
    sender: &'a StreamSender<ObjectsToSynchronizeResponse>,
    glob: Option<GlobMatcher>,
    remaining_total_file_size: i64,
    file_size_limit: i64,
    max_number_of_files: u32,
    number_of_files: u32,
    selected: HashSet<String>,
}

impl<'a> ObjectsVisitor<'a> {
    pub fn new(sender: &'a StreamSender<ObjectsToSynchronizeResponse>, budget: SyncBudget) -> Self {
        Self {
            sender,
            glob: None,
            remaining_total_file_size: budget.max_total_file_size,
            file_size_limit: budget.max_file_size,
            max_number_of_files: budget.max_number_of_files,
            number_of_files: 0,
            selected: HashSet::new(),
        }
    }

    /// Match entries against `glob` from now on.
    pub fn set_glob(&mut self, glob: GlobMatcher) {
        self.glob = Some(glob);
    }

    /// Entries seen so far, matched or not.
    pub fn number_of_files(&self) -> u32 {
        self.number_of_files
    }

    pub fn remaining_total_file_size(&self) -> i64 {
        self.remaining_total_file_size
    }
}

#[async_trait]
impl FetchVisitor for ObjectsVisitor<'_> {
    fn entry(&mut self, path: &str) -> Result<EntryDecision, FetchError> {
        if self.number_of_files == self.max_number_of_files {
            return Err(FetchError::MaxNumberOfFiles(self.max_number_of_files));
        }
        self.number_of_files += 1;

        if is_hidden_dir(path) {
            return Ok(EntryDecision::SKIP);
        }

        let matched = self.glob.as_ref().is_some_and(|glob| glob.matches(path));
        if !matched {
            return Ok(EntryDecision::SKIP);
        }
        if !self.selected.insert(path.to_string()) {
            return Err(FetchError::DuplicatePath {
                path: path.to_string(),
            });
        }
        Ok(EntryDecision::download(
            self.remaining_total_file_size.min(self.file_size_limit),
        ))
    }

    async fn stream_chunk(&mut self, path: &str, data: &[u8]) -> Result<bool, FetchError> {
        self.remaining_total_file_size -= data.len() as i64;
        if self.remaining_total_file_size < 0 {
            // The fetcher was told the maximum size it may send for this file.
            return Err(FetchError::Internal(
                "unexpected negative remaining total file size".to_string(),
            ));
        }

        let msg = SyncMessage::Object {
            source: path.to_string(),
            data: data.to_vec(),
        };
        self.sender
            .send(msg.into())
            .await
            .map_err(|e| FetchError::SendFailed(e.to_string()))?;
        Ok(false)
    }
}

/// Caps the size of every chunk handed to the wrapped visitor.
pub struct ChunkingVisitor<'v, V: ?Sized> {
    delegate: &'v mut V,
    max_chunk_size: usize,
}

impl<'v, V: FetchVisitor + ?Sized> ChunkingVisitor<'v, V> {
    pub fn new(delegate: &'v mut V, max_chunk_size: usize) -> Self {
        Self {
            delegate,
            max_chunk_size: max_chunk_size.max(1),
        }
    }
}

#[async_trait]
impl<V: FetchVisitor + ?Sized> FetchVisitor for ChunkingVisitor<'_, V> {
    fn entry(&mut self, path: &str) -> Result<EntryDecision, FetchError> {
        self.delegate.entry(path)
    }

    async fn stream_chunk(&mut self, path: &str, data: &[u8]) -> Result<bool, FetchError> {
        for chunk in data.chunks(self.max_chunk_size) {
            if self.delegate.stream_chunk(path, chunk).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Whether `path` sits inside a directory whose name starts with a dot.
/// Files at the repository root are never hidden by this rule.
pub fn is_hidden_dir(path: &str) -> bool {
    match path.rsplit_once('/') {
        None => false,
        Some((dir, _)) => dir
            .split('/')
            .any(|part| part.starts_with('.') && part != "."),
    }
}
