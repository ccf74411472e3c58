//! Container runtime backends.
//!
//! One trait covers the lifecycle every engine must provide; optional
//! side-capabilities (generated-file staging, SSH helpers, graceful stop,
//! capability advertisement) are discovered through accessor probing so a
//! backend opts in by overriding the accessor, exactly like contributors.
//!
//! Observable container states:
//!
//! ```text
//! not_found ──create──▶ stopped ──start──▶ running
//! running ──stop──▶ stopped        running ──destroy──▶ not_found
//! stopped ──destroy──▶ not_found
//! ```
//!
//! `Unknown` is a degraded observation; callers gate on it as "not running".

pub mod apple;
pub mod docker;
pub mod nspawn;
mod staging;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::allocator;
use crate::contrib::GeneratedFileMounter;
use crate::contrib::Mount;
use crate::error::ForageErr;
use crate::error::Result;
use crate::host_config::HostConfig;
use crate::paths::Paths;
use crate::spawn::ExecResult;
use crate::ssh::SshCommand;

pub use apple::AppleContainerRuntime;
pub use docker::DockerRuntime;
pub use nspawn::NspawnRuntime;
pub(crate) use staging::stage_generated_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
    NotFound,
    Unknown,
}

impl ContainerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::NotFound => "not_found",
            ContainerStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub status: ContainerStatus,
    /// Raw engine-reported start timestamp; parsed tolerantly by health.
    pub started_at: Option<String>,
    pub ip_address: Option<String>,
}

impl ContainerInfo {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ContainerStatus::NotFound,
            started_at: None,
            ip_address: None,
        }
    }
}

/// Options for `Runtime::create`.
#[derive(Debug, Clone)]
pub struct ContainerCreateOpts {
    pub name: String,
    /// Generator output on disk; consumed by engines that take a config file.
    pub config_path: PathBuf,
    pub start: bool,
    pub bind_mounts: Vec<Mount>,
    /// `(host_port, container_port)` pairs.
    pub forward_ports: Vec<(u16, u16)>,
    pub network_slot: u8,
    /// Image reference for image-based engines.
    pub image: Option<String>,
    pub extra_args: Vec<String>,
}

/// Options for `Runtime::exec`.
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub user: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<Vec<u8>>,
    pub interactive: bool,
}

/// What a backend can actually deliver. Missing capabilities surface as
/// warnings at creation time, never as failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeCapabilities {
    pub nixos_config: bool,
    pub network_isolation: bool,
    pub ephemeral_root: bool,
    pub ssh_access: bool,
    pub generated_files: bool,
    pub resource_limits: bool,
    pub graceful_shutdown: bool,
}

impl RuntimeCapabilities {
    pub fn all() -> Self {
        Self {
            nixos_config: true,
            network_isolation: true,
            ephemeral_root: true,
            ssh_access: true,
            generated_files: true,
            resource_limits: true,
            graceful_shutdown: true,
        }
    }

    /// Names of unsupported capabilities, for warning output.
    pub fn missing(self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (supported, name) in [
            (self.nixos_config, "nixos_config"),
            (self.network_isolation, "network_isolation"),
            (self.ephemeral_root, "ephemeral_root"),
            (self.ssh_access, "ssh_access"),
            (self.generated_files, "generated_files"),
            (self.resource_limits, "resource_limits"),
            (self.graceful_shutdown, "graceful_shutdown"),
        ] {
            if !supported {
                missing.push(name);
            }
        }
        missing
    }
}

/// Uniform container lifecycle over a concrete engine. All operations take a
/// cancellation handle and are safe to call concurrently for distinct
/// container names.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Backend id: `nspawn`, `docker`, `podman`, or `apple`.
    fn name(&self) -> &'static str;

    async fn create(&self, opts: &ContainerCreateOpts, cancel: &CancellationToken) -> Result<()>;

    async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    async fn stop(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    async fn destroy(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    async fn status(&self, name: &str, cancel: &CancellationToken) -> Result<ContainerInfo>;

    async fn is_running(&self, name: &str, cancel: &CancellationToken) -> Result<bool> {
        Ok(self.status(name, cancel).await?.status == ContainerStatus::Running)
    }

    /// All containers this backend owns. Ordering is backend-defined.
    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<ContainerInfo>>;

    /// Run a command inside the container. A non-zero exit code is a value
    /// on the returned result, not an error.
    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        opts: &ExecOpts,
        cancel: &CancellationToken,
    ) -> Result<ExecResult>;

    /// Replace the calling process with an interactive exec. Returns only on
    /// failure.
    fn exec_interactive(&self, name: &str, argv: &[String]) -> ForageErr;

    fn as_generated_file_mounter(&self) -> Option<&dyn GeneratedFileMounter> {
        None
    }

    fn as_ssh_runtime(&self) -> Option<&dyn SshRuntime> {
        None
    }

    fn as_graceful_stopper(&self) -> Option<&dyn GracefulStopper> {
        None
    }

    fn capabilities(&self) -> Option<RuntimeCapabilities> {
        None
    }
}

/// SSH access helpers for backends whose containers run sshd. The host is
/// derived from the sandbox's network slot.
#[async_trait]
pub trait SshRuntime: Send + Sync {
    fn ssh_host(&self, network_slot: u8) -> String {
        allocator::container_ip(network_slot)
    }

    async fn ssh_exec(
        &self,
        network_slot: u8,
        remote_command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        SshCommand::new(self.ssh_host(network_slot))
            .batch_mode(true)
            .remote_command(remote_command)
            .run(cancel)
            .await
    }

    /// Replace the calling process with an interactive SSH session.
    fn ssh_interactive(&self, network_slot: u8, remote_command: Option<&str>) -> ForageErr {
        let mut ssh = SshCommand::new(self.ssh_host(network_slot)).request_tty(true);
        if let Some(command) = remote_command {
            ssh = ssh.remote_command(command);
        }
        ssh.replace_process()
    }
}

#[async_trait]
pub trait GracefulStopper: Send + Sync {
    /// Orderly shutdown bounded by `timeout`; implementations fall back to a
    /// hard stop when the deadline passes.
    async fn graceful_stop(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Instantiate the backend a sandbox was created with.
pub fn runtime_for_id(
    id: &str,
    paths: &Paths,
    host_config: &HostConfig,
) -> Result<Arc<dyn Runtime>> {
    match id {
        "nspawn" => Ok(Arc::new(NspawnRuntime::new(
            paths.clone(),
            host_config.container_prefix.clone(),
            host_config.nixpkgs_path.clone(),
        ))),
        "docker" | "podman" => Ok(Arc::new(DockerRuntime::with_program(
            id,
            paths.clone(),
            host_config.container_prefix.clone(),
        )?)),
        "apple" => Ok(Arc::new(AppleContainerRuntime::new(
            paths.clone(),
            host_config.container_prefix.clone(),
        ))),
        other => Err(ForageErr::NotFound(format!("runtime backend {other}"))),
    }
}
