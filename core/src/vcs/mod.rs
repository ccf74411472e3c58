//! VCS workspace backends.
//!
//! A sandbox's workspace is either a direct bind of an existing directory, a
//! Jujutsu workspace, or a git worktree. The backends own create/remove and
//! the extra mounts the mode needs; snapshots are an optional side-interface.
//! `Create` must be undone by `Remove` on any later failure of the creation
//! pipeline, and `Remove` is idempotent.

mod git_worktree;
mod jj;

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::contrib::Mount;
use crate::error::Result;

pub use git_worktree::GitWorktreeBackend;
pub use jj::JujutsuBackend;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WorkspaceMode {
    Direct,
    Jj,
    GitWorktree,
}

impl WorkspaceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceMode::Direct => "direct",
            WorkspaceMode::Jj => "jj",
            WorkspaceMode::GitWorktree => "git-worktree",
        }
    }
}

#[async_trait]
pub trait WorkspaceBackend: Send + Sync {
    /// Stable backend id; doubles as the persisted `workspace_mode` value.
    fn name(&self) -> &'static str;

    fn is_repo(&self, path: &Path) -> bool;

    async fn exists(&self, repo: &Path, name: &str, cancel: &CancellationToken) -> Result<bool>;

    async fn create(
        &self,
        repo: &Path,
        name: &str,
        workspace_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn remove(
        &self,
        repo: &Path,
        name: &str,
        workspace_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Extra mounts the mode needs inside the container (e.g. the source
    /// repo's backing store so workspace pointers resolve).
    fn workspace_mounts(&self, repo: &Path) -> Vec<Mount> {
        let _ = repo;
        Vec::new()
    }

    /// Snapshot support, when the backend has it.
    fn as_snapshotter(&self) -> Option<&dyn Snapshotter> {
        None
    }
}

#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn snapshot(
        &self,
        repo: &Path,
        workspace_path: &Path,
        name: &str,
        snapshot: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn restore_snapshot(
        &self,
        repo: &Path,
        workspace_path: &Path,
        name: &str,
        snapshot: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn list_snapshots(
        &self,
        repo: &Path,
        workspace_path: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>>;
}

/// Pick a backend for `repo`, trying jj before git: a jj repo usually also
/// contains `.git`, so the order matters.
pub fn detect_backend(repo: &Path) -> Option<Box<dyn WorkspaceBackend>> {
    let jj = JujutsuBackend::new();
    if jj.is_repo(repo) {
        return Some(Box::new(jj));
    }
    let git = GitWorktreeBackend::new();
    if git.is_repo(repo) {
        return Some(Box::new(git));
    }
    None
}

/// Backend for a persisted mode; `Direct` has no backend.
pub fn backend_for_mode(mode: WorkspaceMode) -> Option<Box<dyn WorkspaceBackend>> {
    match mode {
        WorkspaceMode::Direct => None,
        WorkspaceMode::Jj => Some(Box::new(JujutsuBackend::new())),
        WorkspaceMode::GitWorktree => Some(Box::new(GitWorktreeBackend::new())),
    }
}

pub fn mode_for_backend(backend: &dyn WorkspaceBackend) -> WorkspaceMode {
    match backend.name() {
        "jj" => WorkspaceMode::Jj,
        _ => WorkspaceMode::GitWorktree,
    }
}
