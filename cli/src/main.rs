//! Forage CLI
//!
//! Thin multitool over the sandbox lifecycle engine: all provisioning logic
//! lives in `forage-core`; this binary only parses flags and formats output.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap::Subcommand;
use forage_core::SandboxMetadata;
use forage_core::cleanup;
use forage_core::cleanup::CleanupOptions;
use forage_core::create;
use forage_core::create::CreateOptions;
use forage_core::health;
use forage_core::host_config::HostConfig;
use forage_core::metadata::validate_snapshot_name;
use forage_core::paths::Paths;
use forage_core::runtime;
use forage_core::runtime::GracefulStopper as _;
use forage_core::runtime::Runtime;
use forage_core::runtime::SshRuntime as _;
use forage_core::vcs;
use forage_core::vcs::Snapshotter as _;
use forage_core::vcs::WorkspaceBackend as _;
use supports_color::Stream;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, bin_name = "forage", about = "Per-task development sandboxes")]
struct MultitoolCli {
    /// Runtime backend: nspawn, docker, podman, or apple.
    #[arg(long, global = true, default_value = "nspawn")]
    runtime: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create and start a sandbox.
    Create(CreateArgs),
    /// List sandboxes with their health state.
    List,
    /// Full health check of one sandbox.
    Status { name: String },
    /// Stop a sandbox's container, gracefully when the backend supports it.
    Stop {
        name: String,
        /// Seconds to wait for an orderly shutdown before forcing.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Replace this process with an SSH session into the sandbox's
    /// multiplexer.
    Attach { name: String },
    /// Run a command inside a sandbox.
    Exec(ExecArgs),
    /// Destroy a sandbox and everything it owns.
    Remove { name: String },
    /// Snapshot the sandbox workspace, or restore/list snapshots.
    Snapshot(SnapshotArgs),
}

#[derive(Debug, clap::Args)]
struct ExecArgs {
    name: String,

    /// Replace this process with an interactive exec.
    #[arg(long, short = 'i', default_value_t = false)]
    interactive: bool,

    /// Command and arguments to run.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

#[derive(Debug, clap::Args)]
struct CreateArgs {
    name: String,

    /// Template to provision from.
    #[arg(long, default_value = "default")]
    template: String,

    /// Repository to carve the workspace from (or bind with --direct).
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Bind the repo directory directly instead of creating a VCS workspace.
    #[arg(long, default_value_t = false)]
    direct: bool,

    /// Named repo for template mount sets, as name=path. Repeatable.
    #[arg(long = "repos", value_name = "NAME=PATH")]
    repos: Vec<String>,

    /// Extra SSH public key authorized in the container. Repeatable.
    #[arg(long = "ssh-key")]
    ssh_keys: Vec<String>,

    /// Do not mount the host multiplexer config into the container.
    #[arg(long, default_value_t = false)]
    no_mux_config: bool,

    #[arg(long)]
    git_user: Option<String>,

    #[arg(long)]
    git_email: Option<String>,

    #[arg(long)]
    ssh_key_path: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct SnapshotArgs {
    sandbox: String,

    /// Snapshot name; required unless --list.
    snapshot: Option<String>,

    #[arg(long, default_value_t = false)]
    restore: bool,

    #[arg(long, default_value_t = false)]
    list: bool,
}

fn parse_named_repos(raw: &[String]) -> Result<BTreeMap<String, PathBuf>> {
    let mut repos = BTreeMap::new();
    for entry in raw {
        let (name, path) = entry
            .split_once('=')
            .with_context(|| format!("--repos {entry:?} is not name=path"))?;
        repos.insert(name.to_string(), PathBuf::from(path));
    }
    Ok(repos)
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_ansi(supports_color::on_cached(Stream::Stderr).is_some())
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .init();

    let cli = MultitoolCli::parse();
    let paths = Paths::resolve()?;
    let host_config = HostConfig::load(&paths)?;
    let runtime = runtime::runtime_for_id(&cli.runtime, &paths, &host_config)?;
    let cancel = CancellationToken::new();

    match cli.command {
        Command::Create(args) => {
            run_create(args, &paths, &host_config, runtime.as_ref(), &cancel).await
        }
        Command::List => run_list(&paths, &host_config, &cancel).await,
        Command::Status { name } => run_status(&name, &paths, &host_config, &cancel).await,
        Command::Stop { name, timeout } => {
            run_stop(&name, timeout, &paths, &host_config, &cancel).await
        }
        Command::Attach { name } => run_attach(&name, &paths, &host_config, &cancel).await,
        Command::Exec(args) => run_exec(args, &paths, &host_config, &cancel).await,
        Command::Remove { name } => run_remove(&name, &paths, &host_config, &cancel).await,
        Command::Snapshot(args) => run_snapshot(args, &paths, &cancel).await,
    }
}

async fn run_stop(
    name: &str,
    timeout: u64,
    paths: &Paths,
    host_config: &HostConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let metadata = SandboxMetadata::load(paths, name)?;
    let backend = runtime::runtime_for_id(&metadata.runtime, paths, host_config)?;
    match backend.as_graceful_stopper() {
        Some(stopper) => {
            stopper
                .graceful_stop(
                    &metadata.container_name,
                    std::time::Duration::from_secs(timeout),
                    cancel,
                )
                .await?;
        }
        None => backend.stop(&metadata.container_name, cancel).await?,
    }
    println!("stopped {name}");
    Ok(())
}

async fn run_attach(
    name: &str,
    paths: &Paths,
    host_config: &HostConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let metadata = SandboxMetadata::load(paths, name)?;
    let backend = runtime::runtime_for_id(&metadata.runtime, paths, host_config)?;
    if !backend.is_running(&metadata.container_name, cancel).await? {
        bail!("sandbox {name} is not running");
    }
    let Some(ssh) = backend.as_ssh_runtime() else {
        bail!(
            "runtime {} has no SSH path; use `forage exec -i` instead",
            backend.name()
        );
    };
    let control_mode = forage_core::mux::host_supports_control_mode();
    let attach_command = metadata.multiplexer.attach_command(control_mode);
    // Replaces the process; only a failed exec returns.
    let err = ssh.ssh_interactive(metadata.network_slot, attach_command.as_deref());
    bail!("attaching failed: {err}");
}

async fn run_exec(
    args: ExecArgs,
    paths: &Paths,
    host_config: &HostConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let metadata = SandboxMetadata::load(paths, &args.name)?;
    let backend = runtime::runtime_for_id(&metadata.runtime, paths, host_config)?;

    if args.interactive {
        // Replaces the process; only a failed exec reaches the error path.
        let err = backend.exec_interactive(&metadata.container_name, &args.command);
        bail!("interactive exec failed: {err}");
    }

    let opts = forage_core::runtime::ExecOpts {
        user: Some(host_config.username.clone()),
        working_dir: Some(PathBuf::from(
            forage_core::paths::CONTAINER_WORKSPACE_DIR,
        )),
        ..Default::default()
    };
    let result = backend
        .exec(&metadata.container_name, &args.command, &opts, cancel)
        .await?;
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if !result.success() {
        std::process::exit(result.exit_code);
    }
    Ok(())
}

async fn run_create(
    args: CreateArgs,
    paths: &Paths,
    host_config: &HostConfig,
    runtime: &dyn Runtime,
    cancel: &CancellationToken,
) -> Result<()> {
    let options = CreateOptions {
        name: args.name,
        template: args.template,
        repo_path: args.repo,
        direct: args.direct,
        repos: parse_named_repos(&args.repos)?,
        ssh_keys: args.ssh_keys,
        no_mux_config: args.no_mux_config,
        git_user: args.git_user,
        git_email: args.git_email,
        ssh_key_path: args.ssh_key_path,
    };
    let result = create::create(options, host_config, paths, runtime, cancel).await?;

    println!("{}", result.name);
    println!("  address    {}", result.container_ip);
    println!("  workspace  {}", result.workspace.display());
    for warning in &result.capability_warnings {
        println!("  warning    {warning}");
    }
    if !result.ssh_ready {
        println!("  warning    SSH is not reachable yet");
    }
    for failure in &result.init_failures {
        println!(
            "  warning    init command {:?} exited {}",
            failure.command, failure.exit_code
        );
    }
    Ok(())
}

async fn run_list(
    paths: &Paths,
    host_config: &HostConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let summaries = forage_gateway::list_summaries(paths)?;
    if summaries.is_empty() {
        println!("no sandboxes");
        return Ok(());
    }
    let mut current_group = None;
    for summary in summaries {
        if current_group.as_deref() != Some(summary.group.as_str()) {
            println!("{}", summary.group);
            current_group = Some(summary.group.clone());
        }
        let metadata = SandboxMetadata::load(paths, &summary.name)?;
        let status = match runtime::runtime_for_id(&metadata.runtime, paths, host_config) {
            Ok(backend) => {
                let check = health::check(&metadata, backend.as_ref(), cancel).await?;
                health::summary(&check).to_string()
            }
            Err(_) => "unknown".to_string(),
        };
        println!("  {}\t{status}", summary.name);
    }
    Ok(())
}

async fn run_status(
    name: &str,
    paths: &Paths,
    host_config: &HostConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let metadata = SandboxMetadata::load(paths, name)?;
    let backend = runtime::runtime_for_id(&metadata.runtime, paths, host_config)?;
    let check = health::check(&metadata, backend.as_ref(), cancel).await?;

    println!("{name}: {}", health::summary(&check));
    println!("  container  {}", if check.container_running { "running" } else { "stopped" });
    println!("  ssh        {}", if check.ssh_reachable { "reachable" } else { "unreachable" });
    if let Some(uptime) = &check.uptime {
        println!("  uptime     {uptime}");
    }
    if check.mux_active {
        println!("  windows    {}", check.mux_windows.join(", "));
    }
    Ok(())
}

async fn run_remove(
    name: &str,
    paths: &Paths,
    host_config: &HostConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let metadata = SandboxMetadata::load(paths, name)?;
    // The sandbox is torn down with the backend it was created on, not
    // whatever --runtime says today.
    let backend = runtime::runtime_for_id(&metadata.runtime, paths, host_config).ok();
    cleanup::cleanup(
        &metadata,
        &CleanupOptions::everything(),
        backend.as_deref(),
        paths,
        cancel,
    )
    .await;
    println!("removed {name}");
    Ok(())
}

async fn run_snapshot(args: SnapshotArgs, paths: &Paths, cancel: &CancellationToken) -> Result<()> {
    let metadata = SandboxMetadata::load(paths, &args.sandbox)?;
    let Some(backend) = vcs::backend_for_mode(metadata.workspace_mode) else {
        bail!(
            "sandbox {} uses a direct workspace; snapshots need jj or git-worktree mode",
            args.sandbox
        );
    };
    let Some(snapshotter) = backend.as_snapshotter() else {
        bail!("backend {} does not support snapshots", backend.name());
    };
    let repo = metadata
        .source_repo
        .clone()
        .unwrap_or_else(|| metadata.workspace.clone());

    if args.list {
        let snapshots = snapshotter
            .list_snapshots(&repo, &metadata.workspace, &args.sandbox, cancel)
            .await?;
        for snapshot in snapshots {
            println!("{snapshot}");
        }
        return Ok(());
    }

    let Some(snapshot) = args.snapshot else {
        bail!("a snapshot name is required unless --list is given");
    };
    validate_snapshot_name(&snapshot)?;
    if args.restore {
        snapshotter
            .restore_snapshot(&repo, &metadata.workspace, &args.sandbox, &snapshot, cancel)
            .await?;
        println!("restored {snapshot}");
    } else {
        snapshotter
            .snapshot(&repo, &metadata.workspace, &args.sandbox, &snapshot, cancel)
            .await?;
        println!("created {snapshot}");
    }
    Ok(())
}
