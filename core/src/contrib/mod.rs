//! Contribution pipeline.
//!
//! Sandbox composition is assembled from an ordered list of contributors,
//! each implementing whichever capability subsets apply (mounts, packages,
//! env vars, generated files, tmpfiles rules, prompt fragments). The
//! collector runs them sequentially in declaration order and merges their
//! typed outputs into one [`Contributions`] bundle; the capability set of a
//! contributor is discovered by explicit accessor probing, never reflection.

pub mod agents;
pub mod identity;
pub mod secrets;
pub mod standard;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ForageErr;
use crate::error::Result;
use crate::template::Template;

/// One bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host_path: impl Into<PathBuf>, container_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: true,
        }
    }

    pub fn read_write(host_path: impl Into<PathBuf>, container_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
}

impl From<&str> for Package {
    fn from(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl From<String> for Package {
    fn from(name: String) -> Self {
        Self { name }
    }
}

/// A file whose content is produced on the host, staged under the sandbox's
/// staging directory, and bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub container_path: PathBuf,
    pub content: Vec<u8>,
    pub mode: u32,
    pub read_only: bool,
}

/// A fragment of the assembled system prompt. Fragments are grouped by
/// section and ordered by ascending priority; ties keep encounter order.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PromptFragment {
    pub section: String,
    #[serde(default)]
    pub priority: i32,
    pub content: String,
}

/// Merged output of a collection run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Contributions {
    pub mounts: Vec<Mount>,
    pub packages: Vec<Package>,
    pub env_vars: BTreeMap<String, String>,
    pub generated_files: Vec<GeneratedFile>,
    pub tmpfiles_rules: Vec<String>,
    pub prompt_fragments: Vec<PromptFragment>,
}

impl Contributions {
    /// Prompt fragments grouped by section (sections in first-encounter
    /// order), each group already sorted by priority.
    pub fn prompt_sections(&self) -> Vec<(&str, Vec<&PromptFragment>)> {
        let mut sections: Vec<(&str, Vec<&PromptFragment>)> = Vec::new();
        for fragment in &self.prompt_fragments {
            match sections
                .iter_mut()
                .find(|(section, _)| *section == fragment.section)
            {
                Some((_, group)) => group.push(fragment),
                None => sections.push((&fragment.section, vec![fragment])),
            }
        }
        sections
    }
}

/// Context for mount contributions.
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub workspace_path: PathBuf,
    pub source_repo: Option<PathBuf>,
    pub host_home_dir: PathBuf,
    pub container_home_dir: PathBuf,
    pub read_only_workspace: bool,
}

/// Context for env var contributions.
#[derive(Debug, Clone)]
pub struct EnvVarRequest {
    pub sandbox_name: String,
    /// Container-side directory the per-sandbox secrets are mounted at.
    pub secrets_path: Option<PathBuf>,
    pub proxy_url: Option<String>,
}

/// Context for generated file contributions.
#[derive(Debug, Clone)]
pub struct GeneratedFileRequest {
    pub sandbox_name: String,
    pub source_repo: Option<PathBuf>,
    pub workspace_path: PathBuf,
    pub template: Template,
}

/// Context for tmpfiles contributions.
#[derive(Debug, Clone)]
pub struct TmpfilesRequest {
    pub home_dir: PathBuf,
    pub username: String,
}

pub trait MountContributor {
    fn mounts(&self, request: &MountRequest) -> Result<Vec<Mount>>;
}

pub trait PackageContributor {
    fn packages(&self) -> Result<Vec<Package>>;
}

pub trait EnvVarContributor {
    fn env_vars(&self, request: &EnvVarRequest) -> Result<Vec<(String, String)>>;
}

pub trait GeneratedFileContributor {
    fn generated_files(&self, request: &GeneratedFileRequest) -> Result<Vec<GeneratedFile>>;
}

pub trait TmpfilesContributor {
    fn tmpfiles_rules(&self, request: &TmpfilesRequest) -> Result<Vec<String>>;
}

pub trait PromptContributor {
    fn prompt_fragments(&self) -> Result<Vec<PromptFragment>>;
}

/// Umbrella trait: a contributor opts into capabilities by overriding the
/// matching accessor.
pub trait Contributor {
    fn as_mount_contributor(&self) -> Option<&dyn MountContributor> {
        None
    }
    fn as_package_contributor(&self) -> Option<&dyn PackageContributor> {
        None
    }
    fn as_env_var_contributor(&self) -> Option<&dyn EnvVarContributor> {
        None
    }
    fn as_generated_file_contributor(&self) -> Option<&dyn GeneratedFileContributor> {
        None
    }
    fn as_tmpfiles_contributor(&self) -> Option<&dyn TmpfilesContributor> {
        None
    }
    fn as_prompt_contributor(&self) -> Option<&dyn PromptContributor> {
        None
    }
}

/// Persists a generated file and answers with the mount exposing it.
/// Typically the runtime backend's staging implementation.
pub trait GeneratedFileMounter {
    fn mount_generated_file(&self, sandbox: &str, file: &GeneratedFile) -> Result<Mount>;
}

/// The request contexts handed to each capability during a collection run.
#[derive(Debug, Clone)]
pub struct CollectContext {
    pub mount: MountRequest,
    pub env: EnvVarRequest,
    pub generated: GeneratedFileRequest,
    pub tmpfiles: TmpfilesRequest,
}

/// Run the pipeline: sequential, stable order, first error aborts.
///
/// Merge rules: mounts and generated files append in encounter order;
/// packages deduplicate by name keeping the first occurrence; env vars are
/// last-writer-wins across the ordered pipeline; staged generated-file mounts
/// land after all direct mounts; a container-path collision among the final
/// mounts fails the whole collection.
pub fn collect(
    contributors: &[&dyn Contributor],
    context: &CollectContext,
    mounter: &dyn GeneratedFileMounter,
) -> Result<Contributions> {
    let mut out = Contributions::default();

    for contributor in contributors {
        if let Some(c) = contributor.as_mount_contributor() {
            out.mounts.extend(c.mounts(&context.mount)?);
        }
        if let Some(c) = contributor.as_package_contributor() {
            for package in c.packages()? {
                if !out.packages.iter().any(|p| p.name == package.name) {
                    out.packages.push(package);
                }
            }
        }
        if let Some(c) = contributor.as_env_var_contributor() {
            for (name, value) in c.env_vars(&context.env)? {
                out.env_vars.insert(name, value);
            }
        }
        if let Some(c) = contributor.as_generated_file_contributor() {
            out.generated_files
                .extend(c.generated_files(&context.generated)?);
        }
        if let Some(c) = contributor.as_tmpfiles_contributor() {
            out.tmpfiles_rules
                .extend(c.tmpfiles_rules(&context.tmpfiles)?);
        }
        if let Some(c) = contributor.as_prompt_contributor() {
            out.prompt_fragments.extend(c.prompt_fragments()?);
        }
    }

    for file in &out.generated_files {
        let mount = mounter.mount_generated_file(&context.generated.sandbox_name, file)?;
        out.mounts.push(mount);
    }

    for (i, mount) in out.mounts.iter().enumerate() {
        if out.mounts[..i]
            .iter()
            .any(|m| m.container_path == mount.container_path)
        {
            return Err(ForageErr::MountConflict {
                container_path: mount.container_path.clone(),
            });
        }
    }

    sort_prompt_fragments(&mut out.prompt_fragments);
    Ok(out)
}

/// Group by section in first-encounter order, ascending priority within a
/// section, encounter order within equal priorities.
fn sort_prompt_fragments(fragments: &mut [PromptFragment]) {
    let mut section_rank: Vec<String> = Vec::new();
    for fragment in fragments.iter() {
        if !section_rank.contains(&fragment.section) {
            section_rank.push(fragment.section.clone());
        }
    }
    fragments.sort_by_key(|f| {
        let rank = section_rank
            .iter()
            .position(|s| *s == f.section)
            .unwrap_or(usize::MAX);
        (rank, f.priority)
    });
}
