//! Secrets contribution.
//!
//! Secrets are materialized on the host (by the creator, under
//! `secrets_dir/<sandbox>`, dir 0700 / files 0600) and bind-mounted
//! read-only into the container; agents find them through env vars pointing
//! at the mounted files. Values never pass through env or the config blob.

use std::path::Path;
use std::path::PathBuf;

use super::Contributor;
use super::EnvVarContributor;
use super::EnvVarRequest;
use super::Mount;
use super::MountContributor;
use super::MountRequest;
use crate::error::Result;
use crate::template::AgentSpec;

/// Container-side directory the per-sandbox secrets land in.
pub const CONTAINER_SECRETS_DIR: &str = "/run/forage/secrets";

pub struct SecretsContributor {
    host_secrets_dir: PathBuf,
    agents: Vec<AgentSpec>,
}

impl SecretsContributor {
    pub fn new(host_secrets_dir: PathBuf, agents: Vec<AgentSpec>) -> Self {
        Self {
            host_secrets_dir,
            agents,
        }
    }

    fn secret_names(&self) -> impl Iterator<Item = &str> {
        self.agents
            .iter()
            .filter_map(|agent| agent.secret_name.as_deref())
    }
}

/// `ANTHROPIC-api.key` → `FORAGE_SECRET_ANTHROPIC_API_KEY`
fn env_var_name(secret_name: &str) -> String {
    let cleaned: String = secret_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("FORAGE_SECRET_{cleaned}")
}

impl MountContributor for SecretsContributor {
    fn mounts(&self, _request: &MountRequest) -> Result<Vec<Mount>> {
        if self.host_secrets_dir.is_dir() && self.secret_names().next().is_some() {
            Ok(vec![Mount::read_only(
                self.host_secrets_dir.clone(),
                CONTAINER_SECRETS_DIR,
            )])
        } else {
            Ok(Vec::new())
        }
    }
}

impl EnvVarContributor for SecretsContributor {
    fn env_vars(&self, request: &EnvVarRequest) -> Result<Vec<(String, String)>> {
        let base = request
            .secrets_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(CONTAINER_SECRETS_DIR));
        Ok(self
            .secret_names()
            .map(|name| (env_var_name(name), base.join(name).display().to_string()))
            .collect())
    }
}

impl Contributor for SecretsContributor {
    fn as_mount_contributor(&self) -> Option<&dyn MountContributor> {
        Some(self)
    }
    fn as_env_var_contributor(&self) -> Option<&dyn EnvVarContributor> {
        Some(self)
    }
}

/// Copy the host files for every agent-declared secret into the per-sandbox
/// secrets directory. Creates the directory 0700 and the files 0600. Secrets
/// missing from the host map are skipped with a warning; a sandbox without
/// its secret is degraded, not unbuildable.
pub fn materialize_secrets(
    host_secrets: &std::collections::BTreeMap<String, PathBuf>,
    agents: &[AgentSpec],
    sandbox_secrets_dir: &Path,
) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let wanted: Vec<&str> = agents
        .iter()
        .filter_map(|agent| agent.secret_name.as_deref())
        .collect();
    if wanted.is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(sandbox_secrets_dir)?;
    std::fs::set_permissions(sandbox_secrets_dir, std::fs::Permissions::from_mode(0o700))?;
    for name in wanted {
        let Some(source) = host_secrets.get(name) else {
            tracing::warn!("secret {name} is not in the host secrets map, skipping");
            continue;
        };
        let target = sandbox_secrets_dir.join(name);
        std::fs::copy(source, &target)?;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn agent(secret: Option<&str>) -> AgentSpec {
        AgentSpec {
            name: "claude".to_string(),
            secret_name: secret.map(str::to_string),
            prompt_instructions: None,
        }
    }

    #[test]
    fn env_var_names_are_uppercased_and_sanitized() {
        assert_eq!(
            env_var_name("anthropic-api-key"),
            "FORAGE_SECRET_ANTHROPIC_API_KEY"
        );
    }

    #[test]
    fn env_vars_point_into_the_container_secrets_dir() {
        let contributor =
            SecretsContributor::new("/unused".into(), vec![agent(Some("anthropic-api-key"))]);
        let request = EnvVarRequest {
            sandbox_name: "box".into(),
            secrets_path: Some(PathBuf::from(CONTAINER_SECRETS_DIR)),
            proxy_url: None,
        };
        let env = contributor.env_vars(&request).expect("env");
        assert_eq!(
            env,
            vec![(
                "FORAGE_SECRET_ANTHROPIC_API_KEY".to_string(),
                "/run/forage/secrets/anthropic-api-key".to_string()
            )]
        );
    }

    #[test]
    fn no_secrets_means_no_mount() {
        let dir = TempDir::new().expect("tempdir");
        let contributor =
            SecretsContributor::new(dir.path().to_path_buf(), vec![agent(None)]);
        let request = MountRequest {
            workspace_path: "/work".into(),
            source_repo: None,
            host_home_dir: "/home/user".into(),
            container_home_dir: "/home/agent".into(),
            read_only_workspace: false,
        };
        assert!(contributor.mounts(&request).expect("mounts").is_empty());
    }

    #[test]
    fn materialization_sets_tight_modes() {
        let host = TempDir::new().expect("tempdir");
        let secret_file = host.path().join("key");
        std::fs::write(&secret_file, b"sk-secret").expect("write");
        let mut map = std::collections::BTreeMap::new();
        map.insert("anthropic-api-key".to_string(), secret_file);

        let state = TempDir::new().expect("tempdir");
        let sandbox_dir = state.path().join("box");
        materialize_secrets(&map, &[agent(Some("anthropic-api-key"))], &sandbox_dir)
            .expect("materialize");

        let dir_mode = std::fs::metadata(&sandbox_dir)
            .expect("dir metadata")
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file = sandbox_dir.join("anthropic-api-key");
        let file_mode = std::fs::metadata(&file)
            .expect("file metadata")
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
        assert_eq!(std::fs::read(&file).expect("read"), b"sk-secret");
    }

    #[test]
    fn unknown_secret_names_are_skipped() {
        let state = TempDir::new().expect("tempdir");
        let sandbox_dir = state.path().join("box");
        materialize_secrets(
            &std::collections::BTreeMap::new(),
            &[agent(Some("missing"))],
            &sandbox_dir,
        )
        .expect("materialize");
        assert!(!sandbox_dir.join("missing").exists());
    }
}
