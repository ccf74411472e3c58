use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::contrib::PromptFragment;
use crate::error::ForageErr;
use crate::error::Result;
use crate::host_config::AgentIdentityPatch;
use crate::mux::Multiplexer;
use crate::paths::Paths;

/// Declarative sandbox manifest, immutable per creation. Stored as
/// `<templates_dir>/<name>.toml`; the `default` template is built in when no
/// file overrides it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Template {
    pub agents: Vec<AgentSpec>,
    pub multiplexer: Multiplexer,
    pub base_packages: Vec<String>,
    /// Optional named multi-mount set. When present the legacy single
    /// workspace mount is not used.
    pub workspace_mounts: Option<Vec<WorkspaceMountSpec>>,
    /// Shell lines run inside the container after SSH comes up.
    pub init_commands: Vec<String>,
    pub use_proxy: bool,
    pub resource_limits: Option<ResourceLimits>,
    pub prompt_fragments: Vec<PromptFragment>,
    pub agent_identity: Option<AgentIdentityPatch>,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            multiplexer: Multiplexer::Tmux,
            base_packages: Vec::new(),
            workspace_mounts: None,
            init_commands: Vec::new(),
            use_proxy: false,
            resource_limits: None,
            prompt_fragments: Vec::new(),
            agent_identity: None,
        }
    }
}

impl Template {
    /// Load `<templates_dir>/<name>.toml`. The name `default` falls back to
    /// the built-in template when the file is absent; any other missing name
    /// is an error.
    pub fn load(paths: &Paths, name: &str) -> Result<Self> {
        let path = paths.template_path(name);
        if !path.exists() {
            if name == "default" {
                return Ok(Self::default());
            }
            return Err(ForageErr::NotFound(format!("template {name}")));
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&contents)?)
    }
}

/// One agent installed into the sandbox.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentSpec {
    pub name: String,
    /// Key into the host config's secrets map; the named file is copied into
    /// the per-sandbox secrets directory at creation.
    #[serde(default)]
    pub secret_name: Option<String>,
    #[serde(default)]
    pub prompt_instructions: Option<String>,
}

/// One entry of a template's multi-mount workspace set. Exactly one of
/// `host_path` and `repo` must be set: a host path is bind-mounted directly, a
/// repo reference is materialized as a VCS workspace.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceMountSpec {
    pub name: String,
    pub container_path: PathBuf,
    #[serde(default)]
    pub host_path: Option<PathBuf>,
    /// Empty string means "the default repo passed on the command line";
    /// an absolute path is used as-is; anything else is looked up in the
    /// named-repos map.
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::paths_under;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn default_template_is_built_in() {
        let dir = TempDir::new().expect("tempdir");
        let paths = paths_under(dir.path());
        let template = Template::load(&paths, "default").expect("load");
        assert_eq!(template.multiplexer, Multiplexer::Tmux);
        assert!(template.agents.is_empty());
    }

    #[test]
    fn unknown_template_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let paths = paths_under(dir.path());
        assert_matches!(
            Template::load(&paths, "missing"),
            Err(ForageErr::NotFound(_))
        );
    }

    #[test]
    fn parses_a_full_manifest() {
        let dir = TempDir::new().expect("tempdir");
        let paths = paths_under(dir.path());
        paths.ensure_dirs().expect("dirs");
        std::fs::write(
            paths.template_path("rust-dev"),
            r#"
multiplexer = "wezterm"
base_packages = ["ripgrep", "fd"]
init_commands = ["cargo fetch"]
use_proxy = true

[[agents]]
name = "claude"
secret_name = "anthropic-api-key"
prompt_instructions = "Prefer small commits."

[resource_limits]
cpus = 4
memory_mb = 8192

[[workspace_mounts]]
name = "main"
container_path = "/workspace"
repo = ""

[[workspace_mounts]]
name = "docs"
container_path = "/docs"
host_path = "/srv/docs"
read_only = true
"#,
        )
        .expect("write");
        let template = Template::load(&paths, "rust-dev").expect("load");
        assert_eq!(template.multiplexer, Multiplexer::Wezterm);
        assert_eq!(template.agents[0].name, "claude");
        assert_eq!(
            template.agents[0].secret_name.as_deref(),
            Some("anthropic-api-key")
        );
        let mounts = template.workspace_mounts.expect("mounts");
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].repo.as_deref(), Some(""));
        assert_eq!(mounts[1].host_path, Some(PathBuf::from("/srv/docs")));
        assert!(mounts[1].read_only);
    }
}
