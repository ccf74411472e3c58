use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::ContainerCreateOpts;
use super::ContainerInfo;
use super::ContainerStatus;
use super::ExecOpts;
use super::GracefulStopper;
use super::Runtime;
use super::RuntimeCapabilities;
use super::SshRuntime;
use crate::contrib::GeneratedFile;
use crate::contrib::GeneratedFileMounter;
use crate::contrib::Mount;
use crate::error::ForageErr;
use crate::error::Result;
use crate::exec_env;
use crate::metadata::SandboxMetadata;
use crate::paths::Paths;
use crate::spawn;
use crate::spawn::ExecResult;
use crate::spawn::RunOptions;

const BACKEND: &str = "nspawn";

/// Path of the identity file staged into every container; the list fallback
/// reads it to recover the sandbox name for machines whose name matches no
/// persisted metadata.
pub const CONTAINER_METADATA_PATH: &str = "/etc/forage.json";

/// `systemd-nspawn` containers driven through `extra-container` and
/// `machinectl`. Creation and teardown need elevated privileges, so every
/// mutating invocation goes through `sudo`.
pub struct NspawnRuntime {
    paths: Paths,
    container_prefix: String,
    nixpkgs_path: Option<PathBuf>,
}

impl NspawnRuntime {
    pub fn new(paths: Paths, container_prefix: String, nixpkgs_path: Option<PathBuf>) -> Self {
        Self {
            paths,
            container_prefix,
            nixpkgs_path,
        }
    }

    async fn sudo(
        &self,
        op: &str,
        argv: &[String],
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        spawn::run_checked(BACKEND, op, "sudo", argv, &RunOptions::default(), cancel).await
    }

    /// Container names listed by `extra-container list`.
    async fn extra_container_names(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let argv = vec!["extra-container".to_string(), "list".to_string()];
        let result = self.sudo("list", &argv, cancel).await?;
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Map a machine name back to its sandbox name: the reverse map built
    /// from persisted metadata first, then the legacy `<prefix>-<name>`
    /// form, then the identity file inside the container.
    async fn sandbox_name_for_machine(
        &self,
        machine: &str,
        reverse: &std::collections::BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Option<String> {
        if let Some(sandbox) = reverse.get(machine) {
            return Some(sandbox.clone());
        }
        if let Some(rest) = machine.strip_prefix(&format!("{}-", self.container_prefix))
            && SandboxMetadata::exists(&self.paths, rest)
        {
            return Some(rest.to_string());
        }
        let result = self
            .exec(
                machine,
                &["cat".to_string(), CONTAINER_METADATA_PATH.to_string()],
                &ExecOpts::default(),
                cancel,
            )
            .await
            .ok()?;
        if !result.success() {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(&result.stdout).ok()?;
        value
            .get("name")
            .and_then(|n| n.as_str())
            .map(str::to_string)
    }
}

#[async_trait]
impl Runtime for NspawnRuntime {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn create(&self, opts: &ContainerCreateOpts, cancel: &CancellationToken) -> Result<()> {
        let mut argv = vec!["extra-container".to_string(), "create".to_string()];
        if let Some(nixpkgs) = &self.nixpkgs_path {
            argv.push("--nixpkgs-path".to_string());
            argv.push(nixpkgs.display().to_string());
        }
        if opts.start {
            argv.push("--start".to_string());
        }
        argv.extend(opts.extra_args.iter().cloned());
        argv.push(opts.config_path.display().to_string());
        self.sudo("create", &argv, cancel).await?;
        Ok(())
    }

    async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let argv = vec![
            "machinectl".to_string(),
            "start".to_string(),
            name.to_string(),
        ];
        self.sudo("start", &argv, cancel).await?;
        Ok(())
    }

    async fn stop(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let argv = vec![
            "machinectl".to_string(),
            "terminate".to_string(),
            name.to_string(),
        ];
        self.sudo("stop", &argv, cancel).await?;
        Ok(())
    }

    async fn destroy(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let argv = vec![
            "extra-container".to_string(),
            "destroy".to_string(),
            name.to_string(),
        ];
        match self.sudo("destroy", &argv, cancel).await {
            Ok(_) => Ok(()),
            // Destroying an absent container keeps destroy idempotent.
            Err(err) if err.is_absent_target() => {
                debug!("destroy {name}: already gone");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn status(&self, name: &str, cancel: &CancellationToken) -> Result<ContainerInfo> {
        let argv: Vec<String> = [
            "machinectl", "show", "-p", "State", "-p", "Since", "-p", "IPAddress", "--value", name,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        let result = spawn::run_captured("machinectl", &argv[1..], &RunOptions::default(), cancel)
            .await?;
        if !result.success() {
            // Not registered with machined: either stopped (definition still
            // present) or gone entirely.
            let known = self.extra_container_names(cancel).await.unwrap_or_default();
            let status = if known.iter().any(|n| n == name) {
                ContainerStatus::Stopped
            } else {
                ContainerStatus::NotFound
            };
            return Ok(ContainerInfo {
                name: name.to_string(),
                status,
                started_at: None,
                ip_address: None,
            });
        }
        let mut lines = result.stdout.lines();
        let state = lines.next().unwrap_or_default().trim();
        let since = lines.next().unwrap_or_default().trim();
        let ip = lines.next().unwrap_or_default().trim();
        let status = match state {
            "running" => ContainerStatus::Running,
            "" => ContainerStatus::Unknown,
            _ => ContainerStatus::Stopped,
        };
        Ok(ContainerInfo {
            name: name.to_string(),
            status,
            started_at: (!since.is_empty()).then(|| since.to_string()),
            ip_address: (!ip.is_empty()).then(|| ip.to_string()),
        })
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<ContainerInfo>> {
        let argv: Vec<String> = ["machinectl", "list", "--no-legend"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let result = spawn::run_checked(
            BACKEND,
            "list",
            "machinectl",
            &argv[1..],
            &RunOptions::default(),
            cancel,
        )
        .await?;
        let reverse: std::collections::BTreeMap<String, String> =
            SandboxMetadata::load_all(&self.paths)?
                .into_values()
                .map(|m| (m.container_name, m.name))
                .collect();
        let mut containers = Vec::new();
        for line in result.stdout.lines() {
            let Some(machine) = line.split_whitespace().next() else {
                continue;
            };
            if !machine.starts_with(&self.container_prefix) {
                continue;
            }
            let mut info = self.status(machine, cancel).await?;
            if let Some(sandbox) = self
                .sandbox_name_for_machine(machine, &reverse, cancel)
                .await
            {
                info.name = sandbox;
            }
            containers.push(info);
        }
        Ok(containers)
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        opts: &ExecOpts,
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        let mut command = vec![
            "systemd-run".to_string(),
            format!("--machine={name}"),
            "--pipe".to_string(),
            "--wait".to_string(),
            "--collect".to_string(),
            "--quiet".to_string(),
        ];
        if let Some(user) = &opts.user {
            command.push(format!("--uid={user}"));
        }
        if let Some(dir) = &opts.working_dir {
            command.push(format!("--working-directory={}", dir.display()));
        }
        for (key, value) in &opts.env {
            command.push(format!("--setenv={key}={value}"));
        }
        command.push("--".to_string());
        command.extend(argv.iter().cloned());
        let options = RunOptions {
            stdin: opts.stdin.clone(),
            ..Default::default()
        };
        spawn::run_captured("sudo", &command, &options, cancel).await
    }

    fn exec_interactive(&self, name: &str, argv: &[String]) -> ForageErr {
        let mut command = vec![
            "machinectl".to_string(),
            "shell".to_string(),
            name.to_string(),
        ];
        command.extend(argv.iter().cloned());
        spawn::replace_process("sudo", &command, &exec_env::filtered_env())
    }

    fn as_generated_file_mounter(&self) -> Option<&dyn GeneratedFileMounter> {
        Some(self)
    }

    fn as_ssh_runtime(&self) -> Option<&dyn SshRuntime> {
        Some(self)
    }

    fn as_graceful_stopper(&self) -> Option<&dyn GracefulStopper> {
        Some(self)
    }

    fn capabilities(&self) -> Option<RuntimeCapabilities> {
        Some(RuntimeCapabilities::all())
    }
}

impl GeneratedFileMounter for NspawnRuntime {
    fn mount_generated_file(&self, sandbox: &str, file: &GeneratedFile) -> Result<Mount> {
        let staging_root = self.paths.generated_dir(sandbox);
        std::fs::create_dir_all(&staging_root)?;
        super::stage_generated_file(&staging_root, file)
    }
}

impl SshRuntime for NspawnRuntime {}

#[async_trait]
impl GracefulStopper for NspawnRuntime {
    /// `machinectl poweroff` asks the container's init for an orderly
    /// shutdown; if the machine is still registered when the deadline
    /// passes, fall back to the hard stop.
    async fn graceful_stop(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let argv = vec![
            "machinectl".to_string(),
            "poweroff".to_string(),
            name.to_string(),
        ];
        self.sudo("poweroff", &argv, cancel).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !self.is_running(name, cancel).await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        warn!("{name}: graceful stop timed out after {timeout:?}, terminating");
        self.stop(name, cancel).await
    }
}
