use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Snapshotter;
use super::WorkspaceBackend;
use crate::contrib::Mount;
use crate::error::Result;
use crate::spawn;
use crate::spawn::RunOptions;

const BACKEND: &str = "jj";

/// Jujutsu workspaces. The sandbox works in a `jj workspace` carved off the
/// source repo; snapshots are bookmarks on the workspace's current change.
#[derive(Debug, Default, Clone, Copy)]
pub struct JujutsuBackend;

impl JujutsuBackend {
    pub fn new() -> Self {
        Self
    }
}

fn repo_args(repo: &Path, rest: &[&str]) -> Vec<String> {
    let mut args = vec!["-R".to_string(), repo.display().to_string()];
    args.extend(rest.iter().map(ToString::to_string));
    args
}

fn snapshot_bookmark(name: &str, snapshot: &str) -> String {
    format!("forage-snapshot-{name}-{snapshot}")
}

#[async_trait]
impl WorkspaceBackend for JujutsuBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn is_repo(&self, path: &Path) -> bool {
        path.join(".jj/repo").is_dir()
    }

    async fn exists(&self, repo: &Path, name: &str, cancel: &CancellationToken) -> Result<bool> {
        let args = repo_args(repo, &["workspace", "list"]);
        let result = spawn::run_checked(
            BACKEND,
            "workspace list",
            "jj",
            &args,
            &RunOptions::default(),
            cancel,
        )
        .await?;
        Ok(result
            .stdout
            .lines()
            .any(|line| line.split(':').next() == Some(name)))
    }

    async fn create(
        &self,
        repo: &Path,
        name: &str,
        workspace_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut args = repo_args(repo, &["workspace", "add", "--name", name]);
        args.push(workspace_path.display().to_string());
        spawn::run_checked(
            BACKEND,
            "workspace add",
            "jj",
            &args,
            &RunOptions::default(),
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn remove(
        &self,
        repo: &Path,
        name: &str,
        workspace_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let args = repo_args(repo, &["workspace", "forget", name]);
        let result = spawn::run_captured("jj", &args, &RunOptions::default(), cancel).await?;
        if !result.success() {
            // Already forgotten is fine; remove must be idempotent.
            debug!("jj workspace forget {name}: {}", result.stderr.trim());
        }
        match std::fs::remove_dir_all(workspace_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// The workspace's `.jj` pointer resolves into the source repo, so the
    /// repo's `.jj` store (and `.git`, jj's git backend) must be visible
    /// inside the container at the same host path.
    fn workspace_mounts(&self, repo: &Path) -> Vec<Mount> {
        let mut mounts = vec![Mount::read_write(repo.join(".jj"), repo.join(".jj"))];
        let git_dir = repo.join(".git");
        if git_dir.exists() {
            mounts.push(Mount::read_write(git_dir.clone(), git_dir));
        }
        mounts
    }

    fn as_snapshotter(&self) -> Option<&dyn Snapshotter> {
        Some(self)
    }
}

#[async_trait]
impl Snapshotter for JujutsuBackend {
    async fn snapshot(
        &self,
        _repo: &Path,
        workspace_path: &Path,
        name: &str,
        snapshot: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let bookmark = snapshot_bookmark(name, snapshot);
        let args = repo_args(workspace_path, &["bookmark", "create", &bookmark, "-r", "@"]);
        spawn::run_checked(
            BACKEND,
            "bookmark create",
            "jj",
            &args,
            &RunOptions::default(),
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn restore_snapshot(
        &self,
        _repo: &Path,
        workspace_path: &Path,
        name: &str,
        snapshot: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let bookmark = snapshot_bookmark(name, snapshot);
        let args = repo_args(workspace_path, &["restore", "--from", &bookmark]);
        spawn::run_checked(
            BACKEND,
            "restore",
            "jj",
            &args,
            &RunOptions::default(),
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn list_snapshots(
        &self,
        _repo: &Path,
        workspace_path: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let args = repo_args(
            workspace_path,
            &["bookmark", "list", "-T", "name ++ \"\\n\""],
        );
        let result = spawn::run_checked(
            BACKEND,
            "bookmark list",
            "jj",
            &args,
            &RunOptions::default(),
            cancel,
        )
        .await?;
        let prefix = format!("forage-snapshot-{name}-");
        Ok(result
            .stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix(&prefix))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn repo_probe_requires_the_jj_store_dir() {
        let dir = TempDir::new().expect("tempdir");
        let backend = JujutsuBackend::new();
        assert!(!backend.is_repo(dir.path()));
        // A bare `.jj` file is not a repo.
        std::fs::write(dir.path().join(".jj"), b"").expect("write");
        assert!(!backend.is_repo(dir.path()));
        std::fs::remove_file(dir.path().join(".jj")).expect("rm");
        std::fs::create_dir_all(dir.path().join(".jj/repo")).expect("mkdir");
        assert!(backend.is_repo(dir.path()));
    }

    #[test]
    fn workspace_mounts_expose_the_backing_stores() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(dir.path().join(".jj/repo")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join(".git")).expect("mkdir");
        let mounts = JujutsuBackend::new().workspace_mounts(dir.path());
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].host_path, dir.path().join(".jj"));
        assert_eq!(mounts[0].container_path, dir.path().join(".jj"));
        assert!(!mounts[0].read_only);
    }

    #[test]
    fn bookmark_names_embed_sandbox_and_snapshot() {
        assert_eq!(
            snapshot_bookmark("my-box", "before-refactor"),
            "forage-snapshot-my-box-before-refactor"
        );
    }

    #[tokio::test]
    async fn remove_is_idempotent_without_a_workspace_dir() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(dir.path().join(".jj/repo")).expect("mkdir");
        let backend = JujutsuBackend::new();
        let cancel = CancellationToken::new();
        let missing = dir.path().join("never-created");
        // `jj` itself may be absent in the test environment; only the
        // directory half of remove is exercised here.
        if which::which("jj").is_ok() {
            backend
                .remove(dir.path(), "ghost", &missing, &cancel)
                .await
                .expect("remove");
        }
        assert!(!missing.exists());
    }
}
