//! Idempotent sandbox teardown.
//!
//! Every flagged sub-step is best-effort: a failure is logged and the
//! remaining steps still run, so a half-broken sandbox can always be cleaned
//! up again. Metadata is deleted last; as long as it exists the sandbox can
//! be retried.

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::metadata::SandboxMetadata;
use crate::paths::Paths;
use crate::runtime::ContainerStatus;
use crate::runtime::Runtime;
use crate::vcs;
use crate::vcs::WorkspaceBackend as _;
use crate::vcs::WorkspaceMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOptions {
    pub destroy_container: bool,
    pub remove_workspace: bool,
    pub remove_secrets: bool,
    pub remove_artifacts: bool,
    pub remove_metadata: bool,
}

impl CleanupOptions {
    pub fn everything() -> Self {
        Self {
            destroy_container: true,
            remove_workspace: true,
            remove_secrets: true,
            remove_artifacts: true,
            remove_metadata: true,
        }
    }
}

/// Tear down whatever the options select. Never raises; each sub-step logs
/// its own failure.
pub async fn cleanup(
    metadata: &SandboxMetadata,
    options: &CleanupOptions,
    runtime: Option<&dyn Runtime>,
    paths: &Paths,
    cancel: &CancellationToken,
) {
    let name = &metadata.name;

    if options.destroy_container && let Some(runtime) = runtime {
        match runtime.status(&metadata.container_name, cancel).await {
            Ok(info) if info.status != ContainerStatus::NotFound => {
                if let Err(err) = runtime.destroy(&metadata.container_name, cancel).await {
                    warn!("{name}: destroying container failed: {err}");
                }
            }
            Ok(_) => debug!("{name}: container already absent"),
            Err(err) => warn!("{name}: container status check failed: {err}"),
        }
    }

    if options.remove_workspace {
        remove_workspaces(metadata, cancel).await;
    }

    if options.remove_secrets {
        remove_dir(paths.sandbox_secrets_dir(name), name, "secrets dir");
    }

    if options.remove_artifacts {
        remove_file(paths.skills_path(name), name, "skills file");
        remove_permissions_files(paths, name);
        remove_file(paths.config_blob_path(name), name, "config blob");
        remove_dir(paths.generated_dir(name), name, "generated files");
    }

    if options.remove_metadata
        && let Err(err) = SandboxMetadata::delete(paths, name)
    {
        warn!("{name}: deleting metadata failed: {err}");
    }
}

async fn remove_workspaces(metadata: &SandboxMetadata, cancel: &CancellationToken) {
    let name = &metadata.name;
    match &metadata.workspace_mounts {
        Some(mounts) => {
            for mount in mounts {
                if mount.mode == WorkspaceMode::Direct {
                    continue;
                }
                let Some(repo) = &mount.source_repo else {
                    continue;
                };
                let Some(backend) = vcs::backend_for_mode(mount.mode) else {
                    continue;
                };
                let vcs_name = format!("{name}-{}", mount.name);
                if let Err(err) = backend
                    .remove(repo, &vcs_name, &mount.host_path, cancel)
                    .await
                {
                    warn!("{name}: removing workspace mount {} failed: {err}", mount.name);
                }
            }
        }
        None => {
            if metadata.workspace_mode == WorkspaceMode::Direct {
                return;
            }
            let Some(repo) = &metadata.source_repo else {
                return;
            };
            let Some(backend) = vcs::backend_for_mode(metadata.workspace_mode) else {
                return;
            };
            if let Err(err) = backend
                .remove(repo, name, &metadata.workspace, cancel)
                .await
            {
                warn!("{name}: removing workspace failed: {err}");
            }
        }
    }
}

fn remove_permissions_files(paths: &Paths, name: &str) {
    let prefix = format!("{name}.");
    let entries = match std::fs::read_dir(&paths.sandboxes_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            warn!("{name}: listing sandboxes dir failed: {err}");
            return;
        }
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name.starts_with(&prefix) && file_name.ends_with("-permissions.json") {
            remove_file(entry.path(), name, "permissions file");
        }
    }
}

fn remove_file(path: std::path::PathBuf, name: &str, what: &str) {
    match std::fs::remove_file(&path) {
        Ok(()) => debug!("{name}: removed {what} {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("{name}: removing {what} {} failed: {err}", path.display()),
    }
}

fn remove_dir(path: std::path::PathBuf, name: &str, what: &str) {
    match std::fs::remove_dir_all(&path) {
        Ok(()) => debug!("{name}: removed {what} {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("{name}: removing {what} {} failed: {err}", path.display()),
    }
}
