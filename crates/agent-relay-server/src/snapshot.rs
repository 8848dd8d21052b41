//! Tree fetcher serving repository snapshots from the local filesystem.
//!
//! Layout of one repository, under `<root>/<storage_name>/<relative_path>/`:
//!
//! ```text
//! HEAD                  <oid> or "ref: refs/heads/<branch>"
//! refs/heads/<branch>   <oid>
//! refs/tags/<tag>       <oid>
//! trees/<oid>/...       files of that commit
//! ```

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use agent_relay_core::{FetchError, FetchVisitor, GitalyInfo, PollInfo, Repository, TreeFetcher};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

use crate::glob::REPOSITORY_ROOT;

/// Size of the buffer file contents are read with.
const READ_CHUNK_SIZE: usize = 64 * 1024;

const SYMBOLIC_REF_PREFIX: &str = "ref: ";

/// Refs to try, in order, when resolving `ref_name`. An empty name means the
/// default branch.
pub fn ref_candidates(ref_name: &str) -> Vec<String> {
    if ref_name.is_empty() {
        vec!["HEAD".to_string(), "refs/heads/master".to_string()]
    } else {
        vec![
            format!("refs/heads/{}", ref_name),
            format!("refs/tags/{}", ref_name),
        ]
    }
}

/// Resolve `ref_name` using `lookup`, which maps a full ref name to the
/// commit it points at.
pub fn resolve_ref<F>(ref_name: &str, mut lookup: F) -> Result<String, FetchError>
where
    F: FnMut(&str) -> Option<String>,
{
    ref_candidates(ref_name)
        .iter()
        .find_map(|candidate| lookup(candidate))
        .ok_or_else(|| missing_ref(ref_name))
}

fn missing_ref(ref_name: &str) -> FetchError {
    if ref_name.is_empty() {
        FetchError::DefaultBranchNotFound
    } else {
        FetchError::RefNotFound(ref_name.to_string())
    }
}

pub struct SnapshotTreeFetcher {
    root: PathBuf,
}

impl SnapshotTreeFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn repo_dir(&self, repo: &Repository) -> Result<PathBuf, FetchError> {
        let storage = join_relative(&self.root, &repo.storage_name)?;
        join_relative(&storage, &repo.relative_path)
    }

    fn tree_dir(&self, repo: &Repository, revision: &str) -> Result<PathBuf, FetchError> {
        if revision.is_empty() || revision.contains('/') || revision == "." || revision == ".." {
            return Err(FetchError::RefNotFound(revision.to_string()));
        }
        Ok(self.repo_dir(repo)?.join("trees").join(revision))
    }

    /// Commit a ref points at, following one level of symbolic ref.
    async fn read_ref(&self, repo_dir: &Path, name: &str) -> Result<Option<String>, FetchError> {
        let Some(value) = read_ref_file(repo_dir, name).await? else {
            return Ok(None);
        };
        match value.strip_prefix(SYMBOLIC_REF_PREFIX) {
            Some(target) => read_ref_file(repo_dir, target.trim()).await,
            None => Ok(Some(value)),
        }
    }
}

async fn read_ref_file(repo_dir: &Path, name: &str) -> Result<Option<String>, FetchError> {
    let path = join_relative(repo_dir, name)?;
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => {
            let value = content.trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Join a `/`-separated relative path onto `base`, refusing anything that
/// could leave it.
fn join_relative(base: &Path, relative: &str) -> Result<PathBuf, FetchError> {
    let mut path = base.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => {
                return Err(FetchError::NotFound {
                    path: relative.to_string(),
                })
            }
        }
    }
    Ok(path)
}

/// Files under `start`, as paths relative to `tree_dir`, sorted.
async fn list_files(
    tree_dir: &Path,
    start: &Path,
    recursive: bool,
) -> Result<Vec<(String, PathBuf)>, FetchError> {
    let mut files = Vec::new();
    let mut dirs = vec![start.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                if recursive {
                    dirs.push(path);
                }
            } else if file_type.is_file() {
                files.push((repo_path(tree_dir, &path)?, path));
            }
        }
    }
    files.sort();
    Ok(files)
}

fn repo_path(tree_dir: &Path, path: &Path) -> Result<String, FetchError> {
    let relative = path
        .strip_prefix(tree_dir)
        .map_err(|e| FetchError::Internal(e.to_string()))?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    Ok(parts.join("/"))
}

#[async_trait]
impl TreeFetcher for SnapshotTreeFetcher {
    #[instrument(skip(self, _gitaly_info, repo), level = "debug")]
    async fn poll(
        &self,
        _gitaly_info: &GitalyInfo,
        repo: &Repository,
        last_commit_id: &str,
        ref_name: &str,
    ) -> Result<PollInfo, FetchError> {
        let repo_dir = self.repo_dir(repo)?;
        let mut refs = HashMap::new();
        for candidate in ref_candidates(ref_name) {
            if let Some(commit_id) = self.read_ref(&repo_dir, &candidate).await? {
                refs.insert(candidate, commit_id);
            }
        }
        let commit_id = resolve_ref(ref_name, |name| refs.get(name).cloned())?;
        Ok(PollInfo {
            update_available: commit_id != last_commit_id,
            commit_id,
        })
    }

    #[instrument(skip(self, _gitaly_info, repo, visitor), level = "debug")]
    async fn visit(
        &self,
        _gitaly_info: &GitalyInfo,
        repo: &Repository,
        revision: &str,
        prefix: &str,
        recursive: bool,
        visitor: &mut dyn FetchVisitor,
    ) -> Result<(), FetchError> {
        let tree_dir = self.tree_dir(repo, revision)?;
        if !tokio::fs::try_exists(&tree_dir).await? {
            return Err(FetchError::RefNotFound(revision.to_string()));
        }
        let start = if prefix == REPOSITORY_ROOT {
            tree_dir.clone()
        } else {
            join_relative(&tree_dir, prefix)?
        };

        match tokio::fs::metadata(&start).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(FetchError::UnexpectedTreeEntryType {
                    path: prefix.to_string(),
                })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Prefix {} not found at {}", prefix, revision);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        for (path, full_path) in list_files(&tree_dir, &start, recursive).await? {
            let decision = visitor.entry(&path)?;
            if !decision.download {
                continue;
            }
            if stream_file(&path, &full_path, decision.max_size, visitor).await? {
                break;
            }
        }
        Ok(())
    }

    #[instrument(skip(self, _gitaly_info, repo), level = "debug")]
    async fn fetch_file(
        &self,
        _gitaly_info: &GitalyInfo,
        repo: &Repository,
        revision: &str,
        path: &str,
        max_size: i64,
    ) -> Result<Option<Vec<u8>>, FetchError> {
        let full_path = join_relative(&self.tree_dir(repo, revision)?, path)?;
        let meta = match tokio::fs::metadata(&full_path).await {
            Ok(meta) => meta,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Err(FetchError::UnexpectedTreeEntryType {
                path: path.to_string(),
            });
        }
        check_size(path, meta.len(), max_size)?;
        Ok(Some(tokio::fs::read(&full_path).await?))
    }
}

fn check_size(path: &str, size: u64, max_size: i64) -> Result<(), FetchError> {
    match i64::try_from(size) {
        Ok(n) if n <= max_size => Ok(()),
        _ => Err(FetchError::FileTooBig {
            path: path.to_string(),
            size,
            max_size,
        }),
    }
}

/// Stream one file to the visitor. Returns `true` if the visitor is done.
async fn stream_file(
    path: &str,
    full_path: &Path,
    max_size: i64,
    visitor: &mut dyn FetchVisitor,
) -> Result<bool, FetchError> {
    let mut file = tokio::fs::File::open(full_path).await?;
    check_size(path, file.metadata().await?.len(), max_size)?;

    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = read_full(&mut file, &mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        // The file may have grown since it was measured.
        total += n as u64;
        check_size(path, total, max_size)?;
        if visitor.stream_chunk(path, &buf[..n]).await? {
            return Ok(true);
        }
    }
}

/// Fill `buf` unless the file ends first.
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
