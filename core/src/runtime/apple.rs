use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::ContainerCreateOpts;
use super::ContainerInfo;
use super::ContainerStatus;
use super::ExecOpts;
use super::Runtime;
use super::RuntimeCapabilities;
use super::docker::parse_flat_inspect_status;
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

const BACKEND: &str = "apple";
const PROGRAM: &str = "container";

/// Apple Container (`container` CLI). Only available on macOS; the CLI
/// surface mirrors docker closely enough that the differences stay local to
/// argument spelling and inspect output.
pub struct AppleContainerRuntime {
    paths: Paths,
    container_prefix: String,
}

impl AppleContainerRuntime {
    pub fn new(paths: Paths, container_prefix: String) -> Self {
        Self {
            paths,
            container_prefix,
        }
    }

    pub fn detect(paths: Paths, container_prefix: String) -> Result<Self> {
        if !cfg!(target_os = "macos") {
            return Err(ForageErr::InvalidInput(
                "the apple backend requires macOS".to_string(),
            ));
        }
        which::which(PROGRAM)
            .map_err(|_| ForageErr::NotFound("container CLI".to_string()))?;
        Ok(Self::new(paths, container_prefix))
    }

    async fn run(
        &self,
        op: &str,
        args: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        spawn::run_checked(BACKEND, op, PROGRAM, &args, &RunOptions::default(), cancel).await
    }
}

#[async_trait]
impl Runtime for AppleContainerRuntime {
    fn name(&self) -> &'static str {
        BACKEND
    }

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
            args.push("--volume".to_string());
            args.push(spec);
        }
        for (host_port, container_port) in &opts.forward_ports {
            args.push("--publish".to_string());
            args.push(format!("{host_port}:{container_port}"));
        }
        args.extend(opts.extra_args.iter().cloned());
        let image = opts
            .image
            .clone()
            .ok_or_else(|| ForageErr::InvalidInput("apple create requires an image".to_string()))?;
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
        let args = vec![
            "delete".to_string(),
            "--force".to_string(),
            name.to_string(),
        ];
        match self.run("destroy", args, cancel).await {
            Ok(_) => Ok(()),
            // Deleting an absent container keeps destroy idempotent.
            Err(err) if err.is_absent_target() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn status(&self, name: &str, cancel: &CancellationToken) -> Result<ContainerInfo> {
        let args = vec!["inspect".to_string(), name.to_string()];
        let result = spawn::run_captured(PROGRAM, &args, &RunOptions::default(), cancel).await?;
        if !result.success() {
            return Ok(ContainerInfo::not_found(name));
        }
        Ok(
            parse_flat_inspect_status(&result.stdout, name).unwrap_or(ContainerInfo {
                name: name.to_string(),
                status: ContainerStatus::Unknown,
                started_at: None,
                ip_address: None,
            }),
        )
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<ContainerInfo>> {
        let args: Vec<String> = ["list", "--all", "--format", "{{.Names}}"]
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
            args.push("--user".to_string());
            args.push(user.clone());
        }
        if let Some(dir) = &opts.working_dir {
            args.push("--workdir".to_string());
            args.push(dir.display().to_string());
        }
        for (key, value) in &opts.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        if opts.stdin.is_some() || opts.interactive {
            args.push("--interactive".to_string());
        }
        args.push(name.to_string());
        args.extend(argv.iter().cloned());
        let options = RunOptions {
            stdin: opts.stdin.clone(),
            ..Default::default()
        };
        spawn::run_captured(PROGRAM, &args, &options, cancel).await
    }

    fn exec_interactive(&self, name: &str, argv: &[String]) -> ForageErr {
        let mut args = vec![
            "exec".to_string(),
            "--interactive".to_string(),
            "--tty".to_string(),
            name.to_string(),
        ];
        args.extend(argv.iter().cloned());
        spawn::replace_process(PROGRAM, &args, &exec_env::filtered_env())
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

impl GeneratedFileMounter for AppleContainerRuntime {
    fn mount_generated_file(&self, sandbox: &str, file: &GeneratedFile) -> Result<Mount> {
        let staging_root = self.paths.generated_dir(sandbox);
        std::fs::create_dir_all(&staging_root)?;
        super::stage_generated_file(&staging_root, file)
    }
}
