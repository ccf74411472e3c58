//! End-to-end sandbox provisioning.
//!
//! The creator is a sequential pipeline: validate, lock, allocate, resolve
//! identity, materialize the workspace, collect contributions, generate the
//! container config, persist metadata, start the container. Everything after
//! metadata materialization is covered by a rollback that runs full cleanup,
//! so a failed creation never leaves a half-built sandbox: metadata on disk
//! implies a container exists (or is one retry away), and no metadata means
//! no other artifact survives. Post-start steps (SSH readiness, init
//! commands) only ever produce warnings.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::allocator;
use crate::cleanup;
use crate::cleanup::CleanupOptions;
use crate::container_config;
use crate::container_config::ContainerConfig;
use crate::contrib;
use crate::contrib::CollectContext;
use crate::contrib::Contributions;
use crate::contrib::Contributor;
use crate::contrib::EnvVarRequest;
use crate::contrib::GeneratedFile;
use crate::contrib::GeneratedFileMounter;
use crate::contrib::GeneratedFileRequest;
use crate::contrib::Mount;
use crate::contrib::MountContributor;
use crate::contrib::MountRequest;
use crate::contrib::PackageContributor;
use crate::contrib::PromptContributor;
use crate::contrib::TmpfilesRequest;
use crate::contrib::agents::AgentsContributor;
use crate::contrib::agents::SkillsContributor;
use crate::contrib::identity::IdentityContributor;
use crate::contrib::identity::gitconfig_identity;
use crate::contrib::secrets;
use crate::contrib::secrets::CONTAINER_SECRETS_DIR;
use crate::contrib::secrets::SecretsContributor;
use crate::contrib::standard::BaseTmpfilesContributor;
use crate::contrib::standard::ClaudeTmpfilesContributor;
use crate::contrib::standard::MetadataFileContributor;
use crate::contrib::standard::ProxyContributor;
use crate::contrib::standard::ReproducibilityContributor;
use crate::contrib::standard::WorkspaceContributor;
use crate::error::ForageErr;
use crate::error::Result;
use crate::host_config::AgentIdentityPatch;
use crate::host_config::HostConfig;
use crate::lockfile::SandboxLock;
use crate::metadata::AgentIdentity;
use crate::metadata::SandboxMetadata;
use crate::metadata::WorkspaceMount;
use crate::metadata::validate_sandbox_name;
use crate::mux::Multiplexer;
use crate::mux::WindowSpec;
use crate::paths::CONTAINER_WORKSPACE_DIR;
use crate::paths::Paths;
use crate::runtime::ContainerCreateOpts;
use crate::runtime::ExecOpts;
use crate::runtime::Runtime;
use crate::ssh::SshCommand;
use crate::template::Template;
use crate::template::WorkspaceMountSpec;
use crate::vcs;
use crate::vcs::WorkspaceBackend as _;
use crate::vcs::WorkspaceMode;

pub const SSH_READY_TIMEOUT: Duration = Duration::from_secs(30);
const SSH_READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: String,
    pub template: String,
    pub repo_path: Option<PathBuf>,
    /// Bind the repo path directly instead of carving a VCS workspace.
    pub direct: bool,
    /// Named repos referenced by template workspace mounts.
    pub repos: BTreeMap<String, PathBuf>,
    /// Extra authorized keys on top of the host config's.
    pub ssh_keys: Vec<String>,
    /// Skip mounting the host's multiplexer config into the container.
    pub no_mux_config: bool,
    pub git_user: Option<String>,
    pub git_email: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stderr: String,
}

#[derive(Debug)]
pub struct CreateResult {
    pub name: String,
    pub container_ip: String,
    pub workspace: PathBuf,
    pub metadata: SandboxMetadata,
    pub capability_warnings: Vec<String>,
    pub ssh_ready: bool,
    /// Failed init commands. Informational; init failures never fail or roll
    /// back a creation.
    pub init_failures: Vec<InitCommandResult>,
}

/// Create a sandbox end to end. See the module docs for the pipeline and
/// rollback contract.
pub async fn create(
    options: CreateOptions,
    host_config: &HostConfig,
    paths: &Paths,
    runtime: &dyn Runtime,
    cancel: &CancellationToken,
) -> Result<CreateResult> {
    validate_sandbox_name(&options.name)?;
    paths.ensure_dirs()?;
    if SandboxMetadata::exists(paths, &options.name) {
        return Err(ForageErr::AlreadyExists(format!("sandbox {}", options.name)));
    }

    let mut lock = SandboxLock::open(paths)?;
    let guard = lock.acquire()?;

    let capability_warnings = capability_warnings(runtime);
    for warning in &capability_warnings {
        warn!("{}: {warning}", options.name);
    }

    let template = Template::load(paths, &options.template)?;
    let existing = SandboxMetadata::load_all(paths)?;
    let slot = allocator::allocate_slot(&allocator::used_slots(existing.values()))?;

    let identity = resolve_identity(&options, host_config, &template)?;

    let workspace = prepare_workspace(&options, &template, paths, cancel).await?;

    let metadata = SandboxMetadata {
        name: options.name.clone(),
        template: options.template.clone(),
        network_slot: slot,
        created_at: Utc::now(),
        container_name: allocator::container_name(&host_config.container_prefix, slot),
        runtime: runtime.name().to_string(),
        multiplexer: template.multiplexer,
        workspace: workspace.primary_path.clone(),
        workspace_mode: workspace.primary_mode,
        source_repo: workspace.primary_repo.clone(),
        git_branch: workspace.git_branch.clone(),
        agent_identity: identity.clone(),
        workspace_mounts: workspace.mounts.clone(),
    };

    // From here on, any failure tears the whole sandbox back down.
    let provisioned = provision(
        &metadata,
        &options,
        &template,
        host_config,
        paths,
        runtime,
        cancel,
    )
    .await;
    if let Err(err) = provisioned {
        warn!("{}: creation failed, rolling back: {err}", metadata.name);
        cleanup::cleanup(
            &metadata,
            &CleanupOptions::everything(),
            Some(runtime),
            paths,
            cancel,
        )
        .await;
        return Err(err);
    }
    drop(guard);

    // Post-start: readiness and init commands are warnings, never failures.
    let container_ip = metadata.container_ip();
    let supports_ssh = runtime
        .capabilities()
        .map(|capabilities| capabilities.ssh_access)
        .unwrap_or(true);
    let ssh_ready = if supports_ssh {
        wait_for_ssh(&container_ip, cancel).await
    } else {
        // Nothing to wait for on backends without an SSH path.
        true
    };
    if !ssh_ready {
        warn!(
            "{}: SSH did not come up within {SSH_READY_TIMEOUT:?}",
            metadata.name
        );
    }

    let init_failures = run_init_commands(&metadata, &template, host_config, runtime, cancel).await;

    info!("{}: sandbox ready at {container_ip}", metadata.name);
    Ok(CreateResult {
        name: metadata.name.clone(),
        container_ip,
        workspace: metadata.workspace.clone(),
        metadata,
        capability_warnings,
        ssh_ready,
        init_failures,
    })
}

fn capability_warnings(runtime: &dyn Runtime) -> Vec<String> {
    match runtime.capabilities() {
        Some(capabilities) => capabilities
            .missing()
            .into_iter()
            .map(|capability| {
                format!(
                    "runtime {} does not support {capability}",
                    runtime.name()
                )
            })
            .collect(),
        None => Vec::new(),
    }
}

/// Merge the four identity tiers, lowest to highest: the host user's
/// `~/.gitconfig`, the host config, the template, the command line.
fn resolve_identity(
    options: &CreateOptions,
    host_config: &HostConfig,
    template: &Template,
) -> Result<AgentIdentity> {
    let mut merged = match host_user_home(host_config) {
        Some(home) => gitconfig_identity(&home.join(".gitconfig")),
        None => AgentIdentityPatch::default(),
    };
    if let Some(patch) = &host_config.agent_identity {
        merged = merged.overlay(patch);
    }
    if let Some(patch) = &template.agent_identity {
        merged = merged.overlay(patch);
    }
    merged = merged.overlay(&AgentIdentityPatch {
        git_user: options.git_user.clone(),
        git_email: options.git_email.clone(),
        ssh_key_path: options.ssh_key_path.clone(),
    });
    AgentIdentity::from_patch(&merged)
}

fn host_user_home(host_config: &HostConfig) -> Option<PathBuf> {
    match &host_config.user {
        None => dirs::home_dir(),
        Some(user) => {
            if std::env::var("USER").as_deref() == Ok(user.as_str()) {
                dirs::home_dir()
            } else {
                Some(PathBuf::from("/home").join(user))
            }
        }
    }
}

struct PreparedWorkspace {
    primary_path: PathBuf,
    primary_mode: WorkspaceMode,
    primary_repo: Option<PathBuf>,
    git_branch: Option<String>,
    mounts: Option<Vec<WorkspaceMount>>,
}

async fn prepare_workspace(
    options: &CreateOptions,
    template: &Template,
    paths: &Paths,
    cancel: &CancellationToken,
) -> Result<PreparedWorkspace> {
    match &template.workspace_mounts {
        Some(specs) => prepare_mount_set(options, specs, paths, cancel).await,
        None => prepare_single_workspace(options, paths, cancel).await,
    }
}

async fn prepare_single_workspace(
    options: &CreateOptions,
    paths: &Paths,
    cancel: &CancellationToken,
) -> Result<PreparedWorkspace> {
    let repo = options
        .repo_path
        .clone()
        .ok_or_else(|| ForageErr::InvalidInput("a repo path is required".to_string()))?;

    if options.direct {
        if !repo.is_dir() {
            return Err(ForageErr::NotFound(format!(
                "workspace directory {}",
                repo.display()
            )));
        }
        return Ok(PreparedWorkspace {
            primary_path: repo,
            primary_mode: WorkspaceMode::Direct,
            primary_repo: None,
            git_branch: None,
            mounts: None,
        });
    }

    let backend = vcs::detect_backend(&repo).ok_or_else(|| {
        ForageErr::InvalidInput(format!(
            "{} is not a jj or git repository; pass --direct to bind it as-is",
            repo.display()
        ))
    })?;
    let mode = vcs::mode_for_backend(backend.as_ref());
    let workspace_path = paths.sandbox_workspace_dir(&options.name);
    if workspace_path.exists() {
        return Err(ForageErr::AlreadyExists(format!(
            "workspace {}",
            workspace_path.display()
        )));
    }
    if backend.exists(&repo, &options.name, cancel).await? {
        return Err(ForageErr::AlreadyExists(format!(
            "{} workspace {}",
            backend.name(),
            options.name
        )));
    }
    backend
        .create(&repo, &options.name, &workspace_path, cancel)
        .await?;

    let git_branch = matches!(mode, WorkspaceMode::GitWorktree)
        .then(|| vcs::GitWorktreeBackend::branch_name(&options.name));
    Ok(PreparedWorkspace {
        primary_path: workspace_path,
        primary_mode: mode,
        primary_repo: Some(repo),
        git_branch,
        mounts: None,
    })
}

async fn prepare_mount_set(
    options: &CreateOptions,
    specs: &[WorkspaceMountSpec],
    paths: &Paths,
    cancel: &CancellationToken,
) -> Result<PreparedWorkspace> {
    validate_mount_specs(specs)?;

    let mut mounts: Vec<WorkspaceMount> = Vec::new();
    for spec in specs {
        let prepared = match (&spec.host_path, &spec.repo) {
            (Some(host_path), None) => {
                if !host_path.is_dir() {
                    rollback_mounts(options, &mounts, cancel).await;
                    return Err(ForageErr::NotFound(format!(
                        "mount {} host path {}",
                        spec.name,
                        host_path.display()
                    )));
                }
                WorkspaceMount {
                    name: spec.name.clone(),
                    host_path: host_path.clone(),
                    container_path: spec.container_path.clone(),
                    read_only: spec.read_only,
                    mode: WorkspaceMode::Direct,
                    source_repo: None,
                }
            }
            (None, Some(repo_ref)) => {
                let materialized = match resolve_repo_ref(repo_ref, options) {
                    Ok(repo) => materialize_repo_mount(options, spec, &repo, paths, cancel).await,
                    Err(err) => Err(err),
                };
                match materialized {
                    Ok(mount) => mount,
                    Err(err) => {
                        rollback_mounts(options, &mounts, cancel).await;
                        return Err(err);
                    }
                }
            }
            // validate_mount_specs already rejected both/neither.
            _ => unreachable!("mount spec validated"),
        };
        mounts.push(prepared);
    }

    let primary = mounts
        .iter()
        .find(|m| m.mode != WorkspaceMode::Direct)
        .or_else(|| mounts.first())
        .ok_or_else(|| ForageErr::InvalidInput("workspace_mounts is empty".to_string()))?;
    Ok(PreparedWorkspace {
        primary_path: primary.host_path.clone(),
        primary_mode: primary.mode,
        primary_repo: primary.source_repo.clone(),
        git_branch: matches!(primary.mode, WorkspaceMode::GitWorktree).then(|| {
            vcs::GitWorktreeBackend::branch_name(&format!("{}-{}", options.name, primary.name))
        }),
        mounts: Some(mounts),
    })
}

fn validate_mount_specs(specs: &[WorkspaceMountSpec]) -> Result<()> {
    if specs.is_empty() {
        return Err(ForageErr::InvalidInput(
            "workspace_mounts must not be empty".to_string(),
        ));
    }
    for (i, spec) in specs.iter().enumerate() {
        if spec.container_path.as_os_str().is_empty() {
            return Err(ForageErr::InvalidInput(format!(
                "mount {} has an empty container_path",
                spec.name
            )));
        }
        match (&spec.host_path, &spec.repo) {
            (Some(_), Some(_)) => {
                return Err(ForageErr::InvalidInput(format!(
                    "mount {} sets both host_path and repo",
                    spec.name
                )));
            }
            (None, None) => {
                return Err(ForageErr::InvalidInput(format!(
                    "mount {} sets neither host_path nor repo",
                    spec.name
                )));
            }
            _ => {}
        }
        if specs[..i]
            .iter()
            .any(|other| other.container_path == spec.container_path)
        {
            return Err(ForageErr::InvalidInput(format!(
                "container path {} is used by two mounts",
                spec.container_path.display()
            )));
        }
    }
    Ok(())
}

/// Empty string → the default `--repo`; absolute path → as-is; anything
/// else → the named-repos map.
fn resolve_repo_ref(repo_ref: &str, options: &CreateOptions) -> Result<PathBuf> {
    if repo_ref.is_empty() {
        return options.repo_path.clone().ok_or_else(|| {
            ForageErr::InvalidInput(
                "template references the default repo but none was given".to_string(),
            )
        });
    }
    let as_path = Path::new(repo_ref);
    if as_path.is_absolute() {
        return Ok(as_path.to_path_buf());
    }
    options
        .repos
        .get(repo_ref)
        .cloned()
        .ok_or_else(|| ForageErr::NotFound(format!("named repo {repo_ref}")))
}

async fn materialize_repo_mount(
    options: &CreateOptions,
    spec: &WorkspaceMountSpec,
    repo: &Path,
    paths: &Paths,
    cancel: &CancellationToken,
) -> Result<WorkspaceMount> {
    let backend = vcs::detect_backend(repo).ok_or_else(|| {
        ForageErr::InvalidInput(format!("{} is not a jj or git repository", repo.display()))
    })?;
    let vcs_name = format!("{}-{}", options.name, spec.name);
    let workspace_path = paths.sandbox_workspace_dir(&options.name).join(&spec.name);
    if workspace_path.exists() {
        return Err(ForageErr::AlreadyExists(format!(
            "workspace {}",
            workspace_path.display()
        )));
    }
    backend
        .create(repo, &vcs_name, &workspace_path, cancel)
        .await?;
    Ok(WorkspaceMount {
        name: spec.name.clone(),
        host_path: workspace_path,
        container_path: spec.container_path.clone(),
        read_only: spec.read_only,
        mode: vcs::mode_for_backend(backend.as_ref()),
        source_repo: Some(repo.to_path_buf()),
    })
}

/// Undo already-materialized VCS mounts after a mid-set failure. Metadata
/// does not exist yet at this point, so cleanup cannot cover these.
async fn rollback_mounts(
    options: &CreateOptions,
    mounts: &[WorkspaceMount],
    cancel: &CancellationToken,
) {
    for mount in mounts {
        let (Some(repo), Some(backend)) = (&mount.source_repo, vcs::backend_for_mode(mount.mode))
        else {
            continue;
        };
        let vcs_name = format!("{}-{}", options.name, mount.name);
        if let Err(err) = backend
            .remove(repo, &vcs_name, &mount.host_path, cancel)
            .await
        {
            warn!(
                "{}: rolling back workspace mount {} failed: {err}",
                options.name, mount.name
            );
        }
    }
}

/// Steps covered by the rollback: secrets, contributions, config blob,
/// metadata persistence, container start.
async fn provision(
    metadata: &SandboxMetadata,
    options: &CreateOptions,
    template: &Template,
    host_config: &HostConfig,
    paths: &Paths,
    runtime: &dyn Runtime,
    cancel: &CancellationToken,
) -> Result<()> {
    secrets::materialize_secrets(
        &host_config.secrets,
        &template.agents,
        &paths.sandbox_secrets_dir(&metadata.name),
    )?;

    let mut contributions =
        collect_contributions(metadata, options, template, host_config, paths, runtime)?;
    write_prompt_artifacts(metadata, template, host_config, paths, &mut contributions)?;

    let mut authorized_keys = host_config.authorized_keys.clone();
    authorized_keys.extend(options.ssh_keys.iter().cloned());
    let config = ContainerConfig {
        name: &metadata.name,
        container_name: &metadata.container_name,
        network_slot: metadata.network_slot,
        authorized_keys: &authorized_keys,
        uid: host_config.uid,
        gid: host_config.gid,
        mux: template.multiplexer,
        runtime_id: runtime.name(),
        username: &host_config.username,
        workspace_dir: CONTAINER_WORKSPACE_DIR,
        state_version: &host_config.state_version,
        resource_limits: template.resource_limits,
        contributions: &contributions,
    };
    let blob = container_config::generate(&config);
    let blob_path = paths.config_blob_path(&metadata.name);
    std::fs::write(&blob_path, blob)?;
    set_mode(&blob_path, 0o644)?;

    metadata.save(paths)?;

    runtime
        .create(
            &ContainerCreateOpts {
                name: metadata.container_name.clone(),
                config_path: blob_path,
                start: true,
                bind_mounts: contributions.mounts.clone(),
                forward_ports: Vec::new(),
                network_slot: metadata.network_slot,
                image: Some(host_config.container_image.clone()),
                extra_args: Vec::new(),
            },
            cancel,
        )
        .await?;
    Ok(())
}

fn collect_contributions(
    metadata: &SandboxMetadata,
    options: &CreateOptions,
    template: &Template,
    host_config: &HostConfig,
    paths: &Paths,
    runtime: &dyn Runtime,
) -> Result<Contributions> {
    let container_home = PathBuf::from(format!("/home/{}", host_config.username));
    let has_secrets = template
        .agents
        .iter()
        .any(|agent| agent.secret_name.is_some());

    let context = CollectContext {
        mount: MountRequest {
            workspace_path: metadata.workspace.clone(),
            source_repo: metadata.source_repo.clone(),
            host_home_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root")),
            container_home_dir: container_home.clone(),
            read_only_workspace: false,
        },
        env: EnvVarRequest {
            sandbox_name: metadata.name.clone(),
            secrets_path: has_secrets.then(|| PathBuf::from(CONTAINER_SECRETS_DIR)),
            proxy_url: host_config
                .proxy_url
                .clone()
                .filter(|_| template.use_proxy),
        },
        generated: GeneratedFileRequest {
            sandbox_name: metadata.name.clone(),
            source_repo: metadata.source_repo.clone(),
            workspace_path: metadata.workspace.clone(),
            template: template.clone(),
        },
        tmpfiles: TmpfilesRequest {
            home_dir: container_home,
            username: host_config.username.clone(),
        },
    };

    let reproducibility = ReproducibilityContributor::new(template.base_packages.clone());
    let workspace = workspace_contributor(metadata);
    let secrets_contributor = SecretsContributor::new(
        paths.sandbox_secrets_dir(&metadata.name),
        template.agents.clone(),
    );
    let vcs_mounts = VcsMountsContributor::for_metadata(metadata);
    let mux_full = template.multiplexer;
    let mux_packages_only = MuxPackagesOnly(template.multiplexer);
    let identity = IdentityContributor::new(metadata.agent_identity.clone());
    let agents = AgentsContributor::new(template.agents.clone());
    let skills = SkillsContributor::new(template.prompt_fragments.clone());

    let proxy = ProxyContributor;
    let base_tmpfiles = BaseTmpfilesContributor;
    let claude_tmpfiles = ClaudeTmpfilesContributor;
    let metadata_file = MetadataFileContributor;

    let mux_contributor: &dyn Contributor = if options.no_mux_config {
        &mux_packages_only
    } else {
        &mux_full
    };
    let contributors: Vec<&dyn Contributor> = vec![
        &reproducibility,
        &workspace,
        &secrets_contributor,
        &vcs_mounts,
        mux_contributor,
        &identity,
        &proxy,
        &base_tmpfiles,
        &claude_tmpfiles,
        &agents,
        &skills,
        &metadata_file,
    ];

    let fallback = PathsMounter(paths);
    let mounter: &dyn GeneratedFileMounter = runtime
        .as_generated_file_mounter()
        .unwrap_or(&fallback);
    contrib::collect(&contributors, &context, mounter)
}

fn workspace_contributor(metadata: &SandboxMetadata) -> WorkspaceContributor {
    match &metadata.workspace_mounts {
        Some(mounts) => WorkspaceContributor::multi(
            mounts
                .iter()
                .map(|m| Mount {
                    host_path: m.host_path.clone(),
                    container_path: m.container_path.clone(),
                    read_only: m.read_only,
                })
                .collect(),
        ),
        None => WorkspaceContributor::single(),
    }
}

/// VCS-backend mounts (e.g. a jj repo's `.jj` and `.git` stores), deduped by
/// container path across the mount set.
struct VcsMountsContributor {
    mounts: Vec<Mount>,
}

impl VcsMountsContributor {
    fn for_metadata(metadata: &SandboxMetadata) -> Self {
        let mut mounts: Vec<Mount> = Vec::new();
        let mut push_repo = |mode: WorkspaceMode, repo: &Option<PathBuf>| {
            let (Some(repo), Some(backend)) = (repo, vcs::backend_for_mode(mode)) else {
                return;
            };
            for mount in backend.workspace_mounts(repo) {
                if !mounts
                    .iter()
                    .any(|m: &Mount| m.container_path == mount.container_path)
                {
                    mounts.push(mount);
                }
            }
        };
        match &metadata.workspace_mounts {
            Some(workspace_mounts) => {
                for mount in workspace_mounts {
                    push_repo(mount.mode, &mount.source_repo);
                }
            }
            None => push_repo(metadata.workspace_mode, &metadata.source_repo),
        }
        Self { mounts }
    }
}

impl MountContributor for VcsMountsContributor {
    fn mounts(&self, _request: &MountRequest) -> Result<Vec<Mount>> {
        Ok(self.mounts.clone())
    }
}

impl Contributor for VcsMountsContributor {
    fn as_mount_contributor(&self) -> Option<&dyn MountContributor> {
        Some(self)
    }
}

/// The multiplexer contribution with host config mounts suppressed
/// (`--no-mux-config`).
struct MuxPackagesOnly(Multiplexer);

impl Contributor for MuxPackagesOnly {
    fn as_package_contributor(&self) -> Option<&dyn PackageContributor> {
        Some(&self.0)
    }
    fn as_prompt_contributor(&self) -> Option<&dyn PromptContributor> {
        Some(&self.0)
    }
}

/// Staging fallback for runtimes without their own generated-file support.
struct PathsMounter<'a>(&'a Paths);

impl GeneratedFileMounter for PathsMounter<'_> {
    fn mount_generated_file(&self, sandbox: &str, file: &GeneratedFile) -> Result<Mount> {
        let staging_root = self.0.generated_dir(sandbox);
        std::fs::create_dir_all(&staging_root)?;
        crate::runtime::stage_generated_file(&staging_root, file)
    }
}

/// Write the assembled system prompt (`<name>.skills.md`) and the per-agent
/// permissions files, appending their mounts.
fn write_prompt_artifacts(
    metadata: &SandboxMetadata,
    template: &Template,
    host_config: &HostConfig,
    paths: &Paths,
    contributions: &mut Contributions,
) -> Result<()> {
    let container_home = PathBuf::from(format!("/home/{}", host_config.username));

    if !contributions.prompt_fragments.is_empty() {
        let mut text = String::new();
        for (section, fragments) in contributions.prompt_sections() {
            text.push_str(&format!("# {section}\n\n"));
            for fragment in fragments {
                text.push_str(&fragment.content);
                text.push_str("\n\n");
            }
        }
        let skills_path = paths.skills_path(&metadata.name);
        std::fs::write(&skills_path, text)?;
        set_mode(&skills_path, 0o644)?;
        push_unique_mount(
            contributions,
            Mount::read_only(skills_path, container_home.join(".config/forage/skills.md")),
        )?;
    }

    for agent in &template.agents {
        let permissions = serde_json::json!({
            "permissions": {
                "allow": [format!("{CONTAINER_WORKSPACE_DIR}/**")],
                "deny": [],
            }
        });
        let path = paths.permissions_path(&metadata.name, &agent.name);
        std::fs::write(&path, serde_json::to_vec_pretty(&permissions)?)?;
        set_mode(&path, 0o644)?;
        push_unique_mount(
            contributions,
            Mount::read_only(
                path,
                container_home
                    .join(".config")
                    .join(&agent.name)
                    .join("permissions.json"),
            ),
        )?;
    }
    Ok(())
}

fn push_unique_mount(contributions: &mut Contributions, mount: Mount) -> Result<()> {
    if contributions
        .mounts
        .iter()
        .any(|m| m.container_path == mount.container_path)
    {
        return Err(ForageErr::MountConflict {
            container_path: mount.container_path,
        });
    }
    contributions.mounts.push(mount);
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

async fn wait_for_ssh(container_ip: &str, cancel: &CancellationToken) -> bool {
    let ssh = SshCommand::new(container_ip);
    let probe = || {
        let ssh = ssh.clone();
        let cancel = cancel.clone();
        async move { ssh.probe(&cancel).await }
    };
    forage_utils_readiness::wait_for_ready(&probe, SSH_READY_POLL_INTERVAL, SSH_READY_TIMEOUT)
        .await
        .is_ok()
}

/// First-start multiplexer windows: one per agent, or a bare shell window
/// when the template has none.
fn mux_windows(template: &Template) -> Vec<WindowSpec> {
    if template.agents.is_empty() {
        return vec![WindowSpec {
            name: "shell".to_string(),
            command: None,
        }];
    }
    template
        .agents
        .iter()
        .map(|agent| WindowSpec {
            name: agent.name.clone(),
            command: Some(agent.name.clone()),
        })
        .collect()
}

/// Bring up the multiplexer session, then run the template's init commands,
/// then `<workspace>/.forage/init` when present. Everything runs as the
/// container user in the workspace dir.
async fn run_init_commands(
    metadata: &SandboxMetadata,
    template: &Template,
    host_config: &HostConfig,
    runtime: &dyn Runtime,
    cancel: &CancellationToken,
) -> Vec<InitCommandResult> {
    let mut failures = Vec::new();
    let exec_opts = ExecOpts {
        user: Some(host_config.username.clone()),
        working_dir: Some(PathBuf::from(CONTAINER_WORKSPACE_DIR)),
        ..Default::default()
    };

    let mut commands = vec![metadata.multiplexer.init_script(&mux_windows(template))];
    commands.extend(template.init_commands.iter().cloned());
    if metadata.workspace.join(".forage/init").is_file() {
        // The workspace is mounted at the container workspace dir, so the
        // hook is addressed by its container path.
        commands.push(format!("sh {CONTAINER_WORKSPACE_DIR}/.forage/init"));
    }

    for command in commands {
        let argv = vec!["sh".to_string(), "-c".to_string(), command.clone()];
        match runtime
            .exec(&metadata.container_name, &argv, &exec_opts, cancel)
            .await
        {
            Ok(result) if result.success() => {}
            Ok(result) => {
                warn!(
                    "{}: init command {command:?} exited {}",
                    metadata.name, result.exit_code
                );
                failures.push(InitCommandResult {
                    command,
                    exit_code: result.exit_code,
                    stderr: result.stderr,
                });
            }
            Err(err) => {
                warn!("{}: init command {command:?} failed to run: {err}", metadata.name);
                failures.push(InitCommandResult {
                    command,
                    exit_code: -1,
                    stderr: err.to_string(),
                });
            }
        }
    }
    failures
}
