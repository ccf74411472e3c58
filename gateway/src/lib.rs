//! Host-side SSH entry point.
//!
//! Installed as the ForceCommand for incoming agent connections: given a
//! sandbox name it replaces itself with an SSH session into that sandbox's
//! multiplexer; with no name it hands the decision to the picker
//! collaborator. Names are validated before anything touches disk.

use std::collections::BTreeMap;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use chrono::DateTime;
use chrono::Utc;
use forage_core::SandboxMetadata;
use forage_core::host_config::HostConfig;
use forage_core::metadata::validate_sandbox_name;
use forage_core::mux;
use forage_core::mux::Multiplexer;
use forage_core::paths::Paths;
use forage_core::runtime;
use forage_core::runtime::Runtime;
use forage_core::ssh::SshCommand;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One row of the picker/list view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSummary {
    pub name: String,
    /// Grouping key: the source repo when set, else the workspace path.
    pub group: String,
    pub container_name: String,
    pub multiplexer: Multiplexer,
    pub created_at: DateTime<Utc>,
}

/// The external picker collaborator. Returns the chosen sandbox name, or
/// `None` when the user declined to pick.
pub trait Picker {
    fn pick(&self, sandboxes: &[SandboxSummary]) -> Result<Option<String>>;
}

/// First whitespace token of `SSH_ORIGINAL_COMMAND`; extra tokens are
/// discarded.
pub fn parse_ssh_original_command(value: &str) -> Option<String> {
    value.split_whitespace().next().map(str::to_string)
}

/// Sandbox summaries grouped by source repo (else workspace), stable order:
/// by group, then by name within a group.
pub fn list_summaries(paths: &Paths) -> Result<Vec<SandboxSummary>> {
    let all = SandboxMetadata::load_all(paths).context("loading sandbox metadata")?;
    let mut grouped: BTreeMap<String, Vec<SandboxSummary>> = BTreeMap::new();
    for metadata in all.into_values() {
        let group = metadata
            .source_repo
            .as_ref()
            .map(|repo| repo.display().to_string())
            .unwrap_or_else(|| metadata.workspace.display().to_string());
        grouped.entry(group.clone()).or_default().push(SandboxSummary {
            name: metadata.name,
            group,
            container_name: metadata.container_name,
            multiplexer: metadata.multiplexer,
            created_at: metadata.created_at,
        });
    }
    let mut summaries = Vec::new();
    for (_, mut group) in grouped {
        group.sort_by(|a, b| a.name.cmp(&b.name));
        summaries.extend(group);
    }
    Ok(summaries)
}

/// Dispatch one gateway invocation. `name` comes from argv or
/// `SSH_ORIGINAL_COMMAND`; without one the picker runs. On an attach this
/// replaces the current process and never returns.
pub async fn dispatch(
    name: Option<String>,
    paths: &Paths,
    host_config: &HostConfig,
    picker: &dyn Picker,
    cancel: &CancellationToken,
) -> Result<()> {
    let name = match name {
        Some(name) => name,
        None => {
            let summaries = list_summaries(paths)?;
            match picker.pick(&summaries)? {
                Some(name) => name,
                None => return Ok(()),
            }
        }
    };
    attach(&name, paths, host_config, cancel).await
}

async fn attach(
    name: &str,
    paths: &Paths,
    host_config: &HostConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    validate_sandbox_name(name)?;
    let metadata = SandboxMetadata::load(paths, name)?;
    let backend = runtime::runtime_for_id(&metadata.runtime, paths, host_config)?;
    attach_with_runtime(&metadata, host_config, backend.as_ref(), cancel).await
}

/// The attach tail with an explicit runtime, so dispatch logic stays
/// exercisable without a live engine. Replaces the process on success.
pub async fn attach_with_runtime(
    metadata: &SandboxMetadata,
    host_config: &HostConfig,
    backend: &dyn runtime::Runtime,
    cancel: &CancellationToken,
) -> Result<()> {
    let name = &metadata.name;
    if !backend.is_running(&metadata.container_name, cancel).await? {
        bail!("sandbox {name} is not running");
    }

    let control_mode = mux::host_supports_control_mode();
    let attach_command = metadata.multiplexer.attach_command(control_mode);
    debug!(
        "{name}: attaching to {} (control mode: {control_mode})",
        metadata.container_ip()
    );

    let mut ssh = SshCommand::new(metadata.container_ip())
        .user(&host_config.username)
        .request_tty(true);
    if let Some(command) = attach_command {
        ssh = ssh.remote_command(command);
    }
    // Replaces the process with the filtered environment; reaching the next
    // line means exec itself failed.
    let err = ssh.replace_process();
    Err(err).context("replacing process with ssh")
}
