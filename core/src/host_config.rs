use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::paths::Paths;

/// Host-wide policy, loaded once per process from `<config_dir>/config.toml`
/// and read-only thereafter. A missing file yields the defaults.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Prefix for container names (`<prefix>-<slot>`).
    pub container_prefix: String,
    /// SSH public keys installed for the in-container user.
    pub authorized_keys: Vec<String>,
    /// Secret name to host path. Only secrets named by an agent are copied.
    pub secrets: BTreeMap<String, PathBuf>,
    /// Outbound proxy URL applied to sandboxes whose template opts in.
    pub proxy_url: Option<String>,
    /// Host-level identity defaults. Partial; merged during creation.
    pub agent_identity: Option<AgentIdentityPatch>,
    /// Host user whose `~/.gitconfig` seeds the lowest identity tier.
    pub user: Option<String>,
    /// In-container username.
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    /// Passed to `extra-container create --nixpkgs-path` when set.
    pub nixpkgs_path: Option<PathBuf>,
    /// Image reference for the docker/podman/apple backends.
    pub container_image: String,
    /// NixOS `system.stateVersion` baked into generated configs.
    pub state_version: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            container_prefix: "forage".to_string(),
            authorized_keys: Vec::new(),
            secrets: BTreeMap::new(),
            proxy_url: None,
            agent_identity: None,
            user: None,
            username: "agent".to_string(),
            uid: 1000,
            gid: 1000,
            nixpkgs_path: None,
            container_image: "nixos/nix".to_string(),
            state_version: "24.05".to_string(),
        }
    }
}

impl HostConfig {
    pub fn load(paths: &Paths) -> Result<Self> {
        let path = paths.host_config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&contents)?)
    }
}

/// A partial identity: any subset of the fields may be present. Higher tiers
/// override lower tiers field by field during creation.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentIdentityPatch {
    pub git_user: Option<String>,
    pub git_email: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
}

impl AgentIdentityPatch {
    pub fn is_empty(&self) -> bool {
        self.git_user.is_none() && self.git_email.is_none() && self.ssh_key_path.is_none()
    }

    /// Overlay `higher` on top of `self`: any field present in `higher` wins.
    pub fn overlay(&self, higher: &AgentIdentityPatch) -> AgentIdentityPatch {
        AgentIdentityPatch {
            git_user: higher.git_user.clone().or_else(|| self.git_user.clone()),
            git_email: higher.git_email.clone().or_else(|| self.git_email.clone()),
            ssh_key_path: higher
                .ssh_key_path
                .clone()
                .or_else(|| self.ssh_key_path.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::paths_under;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let paths = paths_under(dir.path());
        let config = HostConfig::load(&paths).expect("load");
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.container_prefix, "forage");
        assert_eq!(config.username, "agent");
    }

    #[test]
    fn parses_a_partial_config() {
        let dir = TempDir::new().expect("tempdir");
        let paths = paths_under(dir.path());
        paths.ensure_dirs().expect("dirs");
        std::fs::write(
            paths.host_config_path(),
            r#"
container_prefix = "dev"
authorized_keys = ["ssh-ed25519 AAAA… user@host"]
proxy_url = "http://10.0.0.1:3128"

[secrets]
anthropic-api-key = "/run/agenix/anthropic"
"#,
        )
        .expect("write");
        let config = HostConfig::load(&paths).expect("load");
        assert_eq!(config.container_prefix, "dev");
        assert_eq!(config.authorized_keys.len(), 1);
        assert_eq!(
            config.secrets.get("anthropic-api-key"),
            Some(&PathBuf::from("/run/agenix/anthropic"))
        );
        // Unspecified fields keep their defaults.
        assert_eq!(config.uid, 1000);
    }

    #[test]
    fn overlay_prefers_higher_tier_fields() {
        let low = AgentIdentityPatch {
            git_user: Some("low".into()),
            git_email: Some("low@example.com".into()),
            ssh_key_path: None,
        };
        let high = AgentIdentityPatch {
            git_user: Some("high".into()),
            git_email: None,
            ssh_key_path: Some("/home/user/.ssh/id_ed25519".into()),
        };
        let merged = low.overlay(&high);
        assert_eq!(merged.git_user.as_deref(), Some("high"));
        assert_eq!(merged.git_email.as_deref(), Some("low@example.com"));
        assert_eq!(
            merged.ssh_key_path,
            Some(PathBuf::from("/home/user/.ssh/id_ed25519"))
        );
    }
}
