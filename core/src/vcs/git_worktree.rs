use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::Snapshotter;
use super::WorkspaceBackend;
use crate::error::Result;
use crate::spawn;
use crate::spawn::RunOptions;

const BACKEND: &str = "git-worktree";

/// Git worktrees. Each sandbox gets a worktree on its own `forage-<name>`
/// branch; snapshots are tags in the shared object store.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitWorktreeBackend;

impl GitWorktreeBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn branch_name(name: &str) -> String {
        format!("forage-{name}")
    }
}

fn snapshot_tag(name: &str, snapshot: &str) -> String {
    format!("forage-snapshot-{name}-{snapshot}")
}

async fn git(
    op: &str,
    cwd: &Path,
    args: &[&str],
    cancel: &CancellationToken,
) -> Result<spawn::ExecResult> {
    let args: Vec<String> = args.iter().map(ToString::to_string).collect();
    let options = RunOptions {
        cwd: Some(cwd.to_path_buf()),
        ..Default::default()
    };
    spawn::run_checked(BACKEND, op, "git", &args, &options, cancel).await
}

async fn git_status(
    cwd: &Path,
    args: &[&str],
    cancel: &CancellationToken,
) -> Result<spawn::ExecResult> {
    let args: Vec<String> = args.iter().map(ToString::to_string).collect();
    let options = RunOptions {
        cwd: Some(cwd.to_path_buf()),
        ..Default::default()
    };
    spawn::run_captured("git", &args, &options, cancel).await
}

#[async_trait]
impl WorkspaceBackend for GitWorktreeBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    /// `.git` as a directory (normal repo) or a file (worktree/submodule
    /// pointer) both count.
    fn is_repo(&self, path: &Path) -> bool {
        path.join(".git").exists()
    }

    async fn exists(&self, repo: &Path, name: &str, cancel: &CancellationToken) -> Result<bool> {
        let branch = Self::branch_name(name);
        let result = git_status(
            repo,
            &[
                "rev-parse",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ],
            cancel,
        )
        .await?;
        Ok(result.success())
    }

    /// Reuse the sandbox branch when it already exists; otherwise fork a new
    /// branch off `HEAD` together with the worktree.
    async fn create(
        &self,
        repo: &Path,
        name: &str,
        workspace_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let branch = Self::branch_name(name);
        let path = workspace_path.display().to_string();
        if self.exists(repo, name, cancel).await? {
            git(
                "worktree add",
                repo,
                &["worktree", "add", &path, &branch],
                cancel,
            )
            .await?;
        } else {
            git(
                "worktree add",
                repo,
                &["worktree", "add", "-b", &branch, &path, "HEAD"],
                cancel,
            )
            .await?;
        }
        Ok(())
    }

    async fn remove(
        &self,
        repo: &Path,
        name: &str,
        workspace_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let path = workspace_path.display().to_string();
        let plain = git_status(repo, &["worktree", "remove", &path], cancel).await?;
        if !plain.success() {
            debug!("git worktree remove {path}: {}", plain.stderr.trim());
            let forced =
                git_status(repo, &["worktree", "remove", "--force", &path], cancel).await?;
            if !forced.success() {
                debug!(
                    "git worktree remove --force {path}: {}",
                    forced.stderr.trim()
                );
            }
        }
        // The worktree may be gone while the directory lingers (or vice
        // versa after a manual delete); clean both halves.
        match std::fs::remove_dir_all(workspace_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let branch = Self::branch_name(name);
        let deleted = git_status(repo, &["branch", "-D", &branch], cancel).await?;
        if !deleted.success() {
            // Branch deletion failing is not fatal: the branch may be checked
            // out elsewhere or already gone.
            warn!("git branch -D {branch}: {}", deleted.stderr.trim());
        }
        Ok(())
    }

    fn as_snapshotter(&self) -> Option<&dyn Snapshotter> {
        Some(self)
    }
}

#[async_trait]
impl Snapshotter for GitWorktreeBackend {
    async fn snapshot(
        &self,
        _repo: &Path,
        workspace_path: &Path,
        name: &str,
        snapshot: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tag = snapshot_tag(name, snapshot);
        git("tag", workspace_path, &["tag", &tag], cancel).await?;
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
        let tag = snapshot_tag(name, snapshot);
        git(
            "reset",
            workspace_path,
            &["reset", "--hard", &format!("refs/tags/{tag}")],
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
        let prefix = format!("forage-snapshot-{name}-");
        let result = git(
            "tag list",
            workspace_path,
            &["tag", "--list", &format!("{prefix}*")],
            cancel,
        )
        .await?;
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

    fn git_available() -> bool {
        which::which("git").is_ok()
    }

    async fn init_repo(dir: &Path) {
        let cancel = CancellationToken::new();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.name", "test"],
            vec!["config", "user.email", "test@example.com"],
            vec!["commit", "--allow-empty", "-m", "init"],
        ] {
            let args: Vec<String> = args.iter().map(ToString::to_string).collect();
            let options = RunOptions {
                cwd: Some(dir.to_path_buf()),
                ..Default::default()
            };
            spawn::run_checked("git", "test setup", "git", &args, &options, &cancel)
                .await
                .expect("git setup");
        }
    }

    #[test]
    fn branch_and_tag_names_are_prefixed() {
        assert_eq!(GitWorktreeBackend::branch_name("my-box"), "forage-my-box");
        assert_eq!(snapshot_tag("my-box", "s1"), "forage-snapshot-my-box-s1");
    }

    #[tokio::test]
    async fn create_then_remove_round_trips() {
        if !git_available() {
            return;
        }
        let repo = TempDir::new().expect("tempdir");
        init_repo(repo.path()).await;
        let backend = GitWorktreeBackend::new();
        let cancel = CancellationToken::new();
        let workspace = repo.path().join("wt");

        assert!(!backend.exists(repo.path(), "box", &cancel).await.expect("exists"));
        backend
            .create(repo.path(), "box", &workspace, &cancel)
            .await
            .expect("create");
        assert!(workspace.join(".git").exists());
        assert!(backend.exists(repo.path(), "box", &cancel).await.expect("exists"));

        backend
            .remove(repo.path(), "box", &workspace, &cancel)
            .await
            .expect("remove");
        assert!(!workspace.exists());
        assert!(!backend.exists(repo.path(), "box", &cancel).await.expect("exists"));
        // Idempotent.
        backend
            .remove(repo.path(), "box", &workspace, &cancel)
            .await
            .expect("second remove");
    }

    #[tokio::test]
    async fn snapshots_are_listed_by_sandbox() {
        if !git_available() {
            return;
        }
        let repo = TempDir::new().expect("tempdir");
        init_repo(repo.path()).await;
        let backend = GitWorktreeBackend::new();
        let cancel = CancellationToken::new();
        let workspace = repo.path().join("wt");
        backend
            .create(repo.path(), "box", &workspace, &cancel)
            .await
            .expect("create");
        backend
            .snapshot(repo.path(), &workspace, "box", "first", &cancel)
            .await
            .expect("snapshot");
        backend
            .snapshot(repo.path(), &workspace, "box", "second", &cancel)
            .await
            .expect("snapshot");
        let mut snapshots = backend
            .list_snapshots(repo.path(), &workspace, "box", &cancel)
            .await
            .expect("list");
        snapshots.sort();
        assert_eq!(snapshots, vec!["first", "second"]);
    }
}
