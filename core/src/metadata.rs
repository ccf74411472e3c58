use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ForageErr;
use crate::error::Result;
use crate::host_config::AgentIdentityPatch;
use crate::mux::Multiplexer;
use crate::paths::Paths;
use crate::vcs::WorkspaceMode;

pub const MAX_NAME_LEN: usize = 63;

/// Validate a sandbox name: lowercase alphanumeric start, then lowercase
/// alphanumerics, underscores, and dashes, at most 63 characters total.
pub fn validate_sandbox_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(ForageErr::InvalidInput(format!(
            "invalid sandbox name {name:?}: must match ^[a-z0-9][a-z0-9_-]{{0,62}}$"
        )))
    }
}

/// Snapshot names follow the same rule as sandbox names.
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(ForageErr::InvalidInput(format!(
            "invalid snapshot name {name:?}"
        )))
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
        return false;
    }
    name.len() <= MAX_NAME_LEN
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Identity baked into a sandbox: the commit author the agent works as, and
/// optionally a deploy key it pushes with.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AgentIdentity {
    pub git_user: String,
    pub git_email: String,
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
}

impl AgentIdentity {
    /// Validate a merged identity patch. Both git fields are required; the
    /// key path only needs to point at an existing file when present.
    pub fn from_patch(patch: &AgentIdentityPatch) -> Result<Self> {
        let git_user = patch
            .git_user
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ForageErr::InvalidInput("identity is missing git_user".into()))?;
        let git_email = patch
            .git_email
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ForageErr::InvalidInput("identity is missing git_email".into()))?;
        Ok(Self {
            git_user,
            git_email,
            ssh_key_path: patch.ssh_key_path.clone(),
        })
    }
}

/// One mount of a multi-mount workspace set, as materialized on disk.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct WorkspaceMount {
    pub name: String,
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
    /// Mode this mount was materialized with; `direct` entries have no VCS
    /// workspace to roll back.
    pub mode: WorkspaceMode,
    #[serde(default)]
    pub source_repo: Option<PathBuf>,
}

/// Canonical per-sandbox record, one JSON file per sandbox under
/// `sandboxes_dir`. A metadata file on disk is the single source of truth for
/// "this sandbox exists".
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SandboxMetadata {
    pub name: String,
    pub template: String,
    pub network_slot: u8,
    pub created_at: DateTime<Utc>,
    pub container_name: String,
    /// Backend id: `nspawn`, `docker`, `podman`, or `apple`.
    pub runtime: String,
    pub multiplexer: Multiplexer,
    pub workspace: PathBuf,
    pub workspace_mode: WorkspaceMode,
    #[serde(default)]
    pub source_repo: Option<PathBuf>,
    #[serde(default)]
    pub git_branch: Option<String>,
    pub agent_identity: AgentIdentity,
    #[serde(default)]
    pub workspace_mounts: Option<Vec<WorkspaceMount>>,
}

impl SandboxMetadata {
    pub fn container_ip(&self) -> String {
        crate::allocator::container_ip(self.network_slot)
    }

    /// Persist atomically: write a temp file next to the target, then rename.
    pub fn save(&self, paths: &Paths) -> Result<()> {
        let target = paths.metadata_path(&self.name);
        let tmp = target.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    pub fn load(paths: &Paths, name: &str) -> Result<Self> {
        let path = paths.metadata_path(name);
        if !path.exists() {
            return Err(ForageErr::NotFound(format!("sandbox {name}")));
        }
        Self::load_file(&path)
    }

    pub fn exists(paths: &Paths, name: &str) -> bool {
        paths.metadata_path(name).exists()
    }

    fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Load every persisted sandbox, keyed by name. Non-metadata files in the
    /// directory (lock file, config blobs, staged artifacts) are skipped.
    pub fn load_all(paths: &Paths) -> Result<BTreeMap<String, SandboxMetadata>> {
        let mut sandboxes = BTreeMap::new();
        let entries = match std::fs::read_dir(&paths.sandboxes_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(sandboxes),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") || !path.is_file() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_name(stem) {
                continue;
            }
            match Self::load_file(&path) {
                Ok(metadata) => {
                    sandboxes.insert(metadata.name.clone(), metadata);
                }
                Err(err) => {
                    tracing::warn!("skipping unreadable metadata {}: {err}", path.display());
                }
            }
        }
        Ok(sandboxes)
    }

    pub fn delete(paths: &Paths, name: &str) -> Result<()> {
        let path = paths.metadata_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::paths_under;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample(name: &str, slot: u8) -> SandboxMetadata {
        SandboxMetadata {
            name: name.to_string(),
            template: "default".to_string(),
            network_slot: slot,
            created_at: Utc::now(),
            container_name: format!("forage-{slot}"),
            runtime: "nspawn".to_string(),
            multiplexer: Multiplexer::Tmux,
            workspace: PathBuf::from("/work"),
            workspace_mode: WorkspaceMode::Direct,
            source_repo: None,
            git_branch: None,
            agent_identity: AgentIdentity {
                git_user: "agent".to_string(),
                git_email: "agent@example.com".to_string(),
                ssh_key_path: None,
            },
            workspace_mounts: None,
        }
    }

    #[test]
    fn name_rule_accepts_and_rejects() {
        for good in ["a", "box-1", "my_box", "0day", "a-b_c-9"] {
            assert!(is_valid_name(good), "expected {good:?} to be valid");
        }
        for bad in [
            "",
            "../escape",
            "My-Project",
            "has spaces",
            "-starts-with-dash",
            "has;semicolon",
            "_underscore-start",
        ] {
            assert!(!is_valid_name(bad), "expected {bad:?} to be invalid");
        }
        let too_long = "a".repeat(64);
        assert!(!is_valid_name(&too_long));
        let max_len = "a".repeat(63);
        assert!(is_valid_name(&max_len));
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = TempDir::new().expect("tempdir");
        let paths = paths_under(dir.path());
        paths.ensure_dirs().expect("dirs");
        let metadata = sample("round-trip", 7);
        metadata.save(&paths).expect("save");
        let loaded = SandboxMetadata::load(&paths, "round-trip").expect("load");
        assert_eq!(loaded, metadata);
        // No temp file is left behind by the atomic write.
        assert!(!paths.sandboxes_dir.join("round-trip.json.tmp").exists());
    }

    #[test]
    fn load_all_skips_non_metadata_files() {
        let dir = TempDir::new().expect("tempdir");
        let paths = paths_under(dir.path());
        paths.ensure_dirs().expect("dirs");
        sample("one", 1).save(&paths).expect("save");
        sample("two", 2).save(&paths).expect("save");
        std::fs::write(paths.lock_path(), b"").expect("lock");
        std::fs::write(paths.config_blob_path("one"), b"{}").expect("blob");
        let all = SandboxMetadata::load_all(&paths).expect("load_all");
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["one", "two"]);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let paths = paths_under(dir.path());
        paths.ensure_dirs().expect("dirs");
        sample("gone", 3).save(&paths).expect("save");
        SandboxMetadata::delete(&paths, "gone").expect("delete");
        SandboxMetadata::delete(&paths, "gone").expect("second delete");
        assert!(!SandboxMetadata::exists(&paths, "gone"));
    }

    #[test]
    fn identity_patch_requires_both_git_fields() {
        let missing_email = AgentIdentityPatch {
            git_user: Some("agent".into()),
            git_email: None,
            ssh_key_path: None,
        };
        assert!(AgentIdentity::from_patch(&missing_email).is_err());
        let complete = AgentIdentityPatch {
            git_user: Some("agent".into()),
            git_email: Some("agent@example.com".into()),
            ssh_key_path: None,
        };
        let identity = AgentIdentity::from_patch(&complete).expect("identity");
        assert_eq!(identity.git_user, "agent");
    }
}
