use std::path::Path;
use std::path::PathBuf;

use crate::error::ForageErr;
use crate::error::Result;

/// Overrides the state root (where sandboxes, workspaces, and secrets live).
pub const FORAGE_HOME_ENV_VAR: &str = "FORAGE_HOME";

/// File extension of the generator's container-config blob.
pub const CONFIG_BLOB_EXT: &str = "nix";

/// Container-side path every sandbox's primary workspace is mounted at.
pub const CONTAINER_WORKSPACE_DIR: &str = "/workspace";

/// On-disk layout for all host-side state. Every disk operation in the engine
/// is rooted at one of these directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub state_dir: PathBuf,
    pub sandboxes_dir: PathBuf,
    pub workspaces_dir: PathBuf,
    pub secrets_dir: PathBuf,
    pub templates_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl Paths {
    /// Resolve the layout from the environment: `$FORAGE_HOME` wins, else
    /// `~/.local/state/forage` with config under `~/.config/forage`.
    pub fn resolve() -> Result<Self> {
        if let Some(home) = std::env::var_os(FORAGE_HOME_ENV_VAR)
            && !home.is_empty()
        {
            let root = PathBuf::from(home);
            return Ok(Self::from_roots(root.clone(), root.join("config")));
        }
        let home = dirs::home_dir()
            .ok_or_else(|| ForageErr::InvalidInput("cannot determine home directory".into()))?;
        Ok(Self::from_roots(
            home.join(".local/state/forage"),
            home.join(".config/forage"),
        ))
    }

    pub fn from_roots(state_dir: PathBuf, config_dir: PathBuf) -> Self {
        Self {
            sandboxes_dir: state_dir.join("sandboxes"),
            workspaces_dir: state_dir.join("workspaces"),
            secrets_dir: state_dir.join("secrets"),
            templates_dir: config_dir.join("templates"),
            state_dir,
            config_dir,
        }
    }

    /// Create every directory in the layout that does not exist yet.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.state_dir,
            &self.sandboxes_dir,
            &self.workspaces_dir,
            &self.secrets_dir,
            &self.templates_dir,
            &self.config_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.sandboxes_dir.join(".lock")
    }

    pub fn metadata_path(&self, name: &str) -> PathBuf {
        self.sandboxes_dir.join(format!("{name}.json"))
    }

    pub fn config_blob_path(&self, name: &str) -> PathBuf {
        self.sandboxes_dir.join(format!("{name}.{CONFIG_BLOB_EXT}"))
    }

    pub fn generated_dir(&self, name: &str) -> PathBuf {
        self.sandboxes_dir.join(format!("{name}.generated"))
    }

    pub fn skills_path(&self, name: &str) -> PathBuf {
        self.sandboxes_dir.join(format!("{name}.skills.md"))
    }

    pub fn permissions_path(&self, name: &str, agent: &str) -> PathBuf {
        self.sandboxes_dir
            .join(format!("{name}.{agent}-permissions.json"))
    }

    pub fn sandbox_secrets_dir(&self, name: &str) -> PathBuf {
        self.secrets_dir.join(name)
    }

    pub fn sandbox_workspace_dir(&self, name: &str) -> PathBuf {
        self.workspaces_dir.join(name)
    }

    pub fn host_config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn template_path(&self, name: &str) -> PathBuf {
        self.templates_dir.join(format!("{name}.toml"))
    }
}

/// Layout rooted at an arbitrary directory, for tests and one-off tooling.
pub fn paths_under(root: &Path) -> Paths {
    Paths::from_roots(root.to_path_buf(), root.join("config"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn layout_is_rooted_at_state_dir() {
        let paths = paths_under(Path::new("/tmp/forage-test"));
        assert_eq!(
            paths.sandboxes_dir,
            PathBuf::from("/tmp/forage-test/sandboxes")
        );
        assert_eq!(
            paths.metadata_path("box"),
            PathBuf::from("/tmp/forage-test/sandboxes/box.json")
        );
        assert_eq!(
            paths.config_blob_path("box"),
            PathBuf::from("/tmp/forage-test/sandboxes/box.nix")
        );
        assert_eq!(
            paths.generated_dir("box"),
            PathBuf::from("/tmp/forage-test/sandboxes/box.generated")
        );
        assert_eq!(
            paths.permissions_path("box", "claude"),
            PathBuf::from("/tmp/forage-test/sandboxes/box.claude-permissions.json")
        );
    }
}
