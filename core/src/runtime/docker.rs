use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ContainerCreateOpts;
use super::ContainerInfo;
use super::ContainerStatus;
use super::ExecOpts;
use super::Runtime;
use super::RuntimeCapabilities;
use crate::contrib::GeneratedFile;
use crate::contrib::GeneratedFileMounter;
use crate::contrib::Mount;
use crate::error::ForageErr;
use crate::error::Result;
use crate::exec_env;
use crate::paths::Paths;
use crate::spawn;
use crate::spawn::ExecResult;
use crate::spawn::RunOptions;

/// Docker-compatible engines. Podman is preferred when both are installed;
/// the two share a CLI surface, so one backend drives either binary.
pub struct DockerRuntime {
    program: &'static str,
    paths: Paths,
    container_prefix: String,
}

impl DockerRuntime {
    /// Auto-detect the engine: `podman` first, then `docker`.
    pub fn detect(paths: Paths, container_prefix: String) -> Result<Self> {
        for program in ["podman", "docker"] {
            if which::which(program).is_ok() {
                return Ok(Self {
                    program,
                    paths,
                    container_prefix,
                });
            }
        }
        Err(ForageErr::NotFound(
            "container engine (podman or docker)".to_string(),
        ))
    }

    pub fn with_program(program: &str, paths: Paths, container_prefix: String) -> Result<Self> {
        let program = match program {
            "podman" => "podman",
            "docker" => "docker",
            other => {
                return Err(ForageErr::InvalidInput(format!(
                    "unknown docker-family engine {other}"
                )));
            }
        };
        Ok(Self {
            program,
            paths,
            container_prefix,
        })
    }

    async fn run(
        &self,
        op: &str,
        args: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        spawn::run_checked(
            self.program,
            op,
            self.program,
            &args,
            &RunOptions::default(),
            cancel,
        )
        .await
    }
}

fn parse_inspect_status(json: &str) -> Option<ContainerInfo> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(json).ok()?;
    let entry = entries.first()?;
    let name = entry
        .get("Name")
        .and_then(|n| n.as_str())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let state = entry.get("State")?;
    let status = match state.get("Status").and_then(|s| s.as_str()) {
        Some("running") => ContainerStatus::Running,
        Some("exited") | Some("created") | Some("paused") | Some("stopped") => {
            ContainerStatus::Stopped
        }
        _ => ContainerStatus::Unknown,
    };
    let started_at = state
        .get("StartedAt")
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty() && !s.starts_with("0001-"))
        .map(str::to_string);
    let ip_address = entry
        .pointer("/NetworkSettings/IPAddress")
        .and_then(|ip| ip.as_str())
        .filter(|ip| !ip.is_empty())
        .map(str::to_string);
    Some(ContainerInfo {
        name,
        status,
        started_at,
        ip_address,
    })
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn name(&self) -> &'static str {
        self.program
    }

    /// `run` with a keepalive command stands in for create+start; without
    /// `start` the container is created stopped via `create`.
    async fn create(&self, opts: &ContainerCreateOpts, cancel: &CancellationToken) -> Result<()> {
        let verb = if opts.start { "run" } else { "create" };
        let mut args = vec![verb.to_string(), "--name".to_string(), opts.name.clone()];
        if opts.start {
            args.push("--detach".to_string());
        }
        for mount in &opts.bind_mounts {
            let mut spec = format!(
                "{}:{}",
                mount.host_path.display(),
                mount.container_path.display()
            );
            if mount.read_only {
                spec.push_str(":ro");
            }
            args.push("-v".to_string());
            args.push(spec);
        }
        for (host_port, container_port) in &opts.forward_ports {
            args.push("-p".to_string());
            args.push(format!("{host_port}:{container_port}"));
        }
        args.extend(opts.extra_args.iter().cloned());
        let image = opts.image.clone().ok_or_else(|| {
            ForageErr::InvalidInput(format!("{} create requires an image", self.program))
        })?;
        args.push(image);
        args.push("sleep".to_string());
        args.push("infinity".to_string());
        self.run("create", args, cancel).await?;
        Ok(())
    }

    async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.run("start", vec!["start".to_string(), name.to_string()], cancel)
            .await?;
        Ok(())
    }

    async fn stop(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        self.run("stop", vec!["stop".to_string(), name.to_string()], cancel)
            .await?;
        Ok(())
    }

    async fn destroy(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let args = vec!["rm".to_string(), "-f".to_string(), name.to_string()];
        match self.run("destroy", args, cancel).await {
            Ok(_) => {}
            // Removing an absent container keeps destroy idempotent.
            Err(err) if err.is_absent_target() => {}
            Err(err) => return Err(err),
        }
        debug!("{}: destroyed {name}", self.program);
        Ok(())
    }

    async fn status(&self, name: &str, cancel: &CancellationToken) -> Result<ContainerInfo> {
        let args = vec!["inspect".to_string(), name.to_string()];
        let result =
            spawn::run_captured(self.program, &args, &RunOptions::default(), cancel).await?;
        if !result.success() {
            return Ok(ContainerInfo::not_found(name));
        }
        match parse_inspect_status(&result.stdout) {
            Some(mut info) => {
                if info.name.is_empty() {
                    info.name = name.to_string();
                }
                Ok(info)
            }
            None => Ok(ContainerInfo {
                name: name.to_string(),
                status: ContainerStatus::Unknown,
                started_at: None,
                ip_address: None,
            }),
        }
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<ContainerInfo>> {
        let args: Vec<String> = ["ps", "-a", "--format", "{{.Names}}"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let result = self.run("list", args, cancel).await?;
        let mut containers = Vec::new();
        for name in result.stdout.lines().map(str::trim) {
            if name.is_empty() || !name.starts_with(&self.container_prefix) {
                continue;
            }
            containers.push(self.status(name, cancel).await?);
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
        let mut args = vec!["exec".to_string()];
        if let Some(user) = &opts.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        if let Some(dir) = &opts.working_dir {
            args.push("-w".to_string());
            args.push(dir.display().to_string());
        }
        for (key, value) in &opts.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        if opts.stdin.is_some() || opts.interactive {
            args.push("-i".to_string());
        }
        args.push(name.to_string());
        args.extend(argv.iter().cloned());
        let options = RunOptions {
            stdin: opts.stdin.clone(),
            ..Default::default()
        };
        spawn::run_captured(self.program, &args, &options, cancel).await
    }

    fn exec_interactive(&self, name: &str, argv: &[String]) -> ForageErr {
        let mut args = vec!["exec".to_string(), "-it".to_string(), name.to_string()];
        args.extend(argv.iter().cloned());
        spawn::replace_process(self.program, &args, &exec_env::filtered_env())
    }

    fn as_generated_file_mounter(&self) -> Option<&dyn GeneratedFileMounter> {
        Some(self)
    }

    fn capabilities(&self) -> Option<RuntimeCapabilities> {
        Some(RuntimeCapabilities {
            network_isolation: false,
            ssh_access: false,
            ..RuntimeCapabilities::all()
        })
    }
}

impl GeneratedFileMounter for DockerRuntime {
    fn mount_generated_file(&self, sandbox: &str, file: &GeneratedFile) -> Result<Mount> {
        let staging_root = self.paths.generated_dir(sandbox);
        std::fs::create_dir_all(&staging_root)?;
        super::stage_generated_file(&staging_root, file)
    }
}

/// Shared by the apple backend, whose `container inspect` output differs
/// slightly: a flat `status` field instead of `State.Status`.
pub(super) fn parse_flat_inspect_status(json: &str, name: &str) -> Option<ContainerInfo> {
    if let Some(info) = parse_inspect_status(json) {
        return Some(info);
    }
    let entries: Vec<serde_json::Value> = serde_json::from_str(json).ok()?;
    let entry = entries.first()?;
    let status = match entry.get("status").and_then(|s| s.as_str()) {
        Some("running") => ContainerStatus::Running,
        Some("stopped") | Some("exited") | Some("created") => ContainerStatus::Stopped,
        _ => ContainerStatus::Unknown,
    };
    Some(ContainerInfo {
        name: name.to_string(),
        status,
        started_at: None,
        ip_address: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn inspect_json_maps_states() {
        let json = r#"[{
            "Name": "/forage-3",
            "State": {"Status": "running", "StartedAt": "2026-07-28T10:15:00Z"},
            "NetworkSettings": {"IPAddress": "172.17.0.2"}
        }]"#;
        let info = parse_inspect_status(json).expect("info");
        assert_eq!(info.name, "forage-3");
        assert_eq!(info.status, ContainerStatus::Running);
        assert_eq!(info.started_at.as_deref(), Some("2026-07-28T10:15:00Z"));
        assert_eq!(info.ip_address.as_deref(), Some("172.17.0.2"));

        let exited = r#"[{"State": {"Status": "exited", "StartedAt": "0001-01-01T00:00:00Z"}}]"#;
        let info = parse_inspect_status(exited).expect("info");
        assert_eq!(info.status, ContainerStatus::Stopped);
        assert_eq!(info.started_at, None);
    }

    #[test]
    fn inspect_garbage_is_unknown_not_an_error() {
        assert!(parse_inspect_status("[]").is_none());
        assert!(parse_inspect_status("not json").is_none());
        let weird = r#"[{"State": {"Status": "restarting"}}]"#;
        let info = parse_inspect_status(weird).expect("info");
        assert_eq!(info.status, ContainerStatus::Unknown);
    }

    #[test]
    fn flat_status_fallback_parses_apple_output() {
        let json = r#"[{"status": "running"}]"#;
        let info = parse_flat_inspect_status(json, "forage-2").expect("info");
        assert_eq!(info.status, ContainerStatus::Running);
        assert_eq!(info.name, "forage-2");
    }
}
