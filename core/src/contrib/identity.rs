//! Identity contribution: the agent's git author identity and optional
//! deploy key, plus the host `~/.gitconfig` reader that seeds the lowest
//! tier of identity resolution.

use std::path::Path;
use std::path::PathBuf;

use super::Contributor;
use super::GeneratedFile;
use super::GeneratedFileContributor;
use super::GeneratedFileRequest;
use super::Mount;
use super::MountContributor;
use super::MountRequest;
use crate::error::Result;
use crate::host_config::AgentIdentityPatch;
use crate::metadata::AgentIdentity;

pub struct IdentityContributor {
    identity: AgentIdentity,
}

impl IdentityContributor {
    pub fn new(identity: AgentIdentity) -> Self {
        Self { identity }
    }
}

impl GeneratedFileContributor for IdentityContributor {
    fn generated_files(&self, _request: &GeneratedFileRequest) -> Result<Vec<GeneratedFile>> {
        let gitconfig = format!(
            "[user]\n\tname = {}\n\temail = {}\n",
            self.identity.git_user, self.identity.git_email
        );
        Ok(vec![GeneratedFile {
            container_path: PathBuf::from("/etc/gitconfig"),
            content: gitconfig.into_bytes(),
            mode: 0o644,
            read_only: true,
        }])
    }
}

impl MountContributor for IdentityContributor {
    /// The deploy key, when configured, is exposed read-only in the agent's
    /// `~/.ssh`.
    fn mounts(&self, request: &MountRequest) -> Result<Vec<Mount>> {
        let Some(key_path) = &self.identity.ssh_key_path else {
            return Ok(Vec::new());
        };
        let file_name = key_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "id_forage".to_string());
        Ok(vec![Mount::read_only(
            key_path.clone(),
            request.container_home_dir.join(".ssh").join(file_name),
        )])
    }
}

impl Contributor for IdentityContributor {
    fn as_generated_file_contributor(&self) -> Option<&dyn GeneratedFileContributor> {
        Some(self)
    }
    fn as_mount_contributor(&self) -> Option<&dyn MountContributor> {
        Some(self)
    }
}

/// Read `name` and `email` from the `[user]` section of a gitconfig file.
/// Returns an empty patch when the file is missing or has no user section;
/// this feeds the lowest precedence tier, so absence is not an error.
pub fn gitconfig_identity(path: &Path) -> AgentIdentityPatch {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return AgentIdentityPatch::default();
    };
    let mut patch = AgentIdentityPatch::default();
    let mut in_user_section = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_user_section = line == "[user]";
            continue;
        }
        if !in_user_section {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().to_string();
            match key.trim() {
                "name" if !value.is_empty() => patch.git_user = Some(value),
                "email" if !value.is_empty() => patch.git_email = Some(value),
                _ => {}
            }
        }
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Template;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn identity() -> AgentIdentity {
        AgentIdentity {
            git_user: "Forage Agent".to_string(),
            git_email: "agent@example.com".to_string(),
            ssh_key_path: Some(PathBuf::from("/home/user/.ssh/id_ed25519")),
        }
    }

    #[test]
    fn gitconfig_is_generated_with_the_identity() {
        let request = GeneratedFileRequest {
            sandbox_name: "box".into(),
            source_repo: None,
            workspace_path: "/work".into(),
            template: Template::default(),
        };
        let files = IdentityContributor::new(identity())
            .generated_files(&request)
            .expect("files");
        let text = String::from_utf8(files[0].content.clone()).expect("utf8");
        assert!(text.contains("name = Forage Agent"));
        assert!(text.contains("email = agent@example.com"));
    }

    #[test]
    fn ssh_key_mounts_into_the_agent_home() {
        let request = MountRequest {
            workspace_path: "/work".into(),
            source_repo: None,
            host_home_dir: "/home/user".into(),
            container_home_dir: "/home/agent".into(),
            read_only_workspace: false,
        };
        let mounts = IdentityContributor::new(identity())
            .mounts(&request)
            .expect("mounts");
        assert_eq!(mounts.len(), 1);
        assert_eq!(
            mounts[0].container_path,
            PathBuf::from("/home/agent/.ssh/id_ed25519")
        );
        assert!(mounts[0].read_only);
    }

    #[test]
    fn gitconfig_reader_extracts_the_user_section() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(".gitconfig");
        std::fs::write(
            &path,
            "[core]\n\teditor = vi\n[user]\n\tname = Host User\n\temail = host@example.com\n[alias]\n\tname = bogus\n",
        )
        .expect("write");
        let patch = gitconfig_identity(&path);
        assert_eq!(patch.git_user.as_deref(), Some("Host User"));
        assert_eq!(patch.git_email.as_deref(), Some("host@example.com"));
    }

    #[test]
    fn missing_gitconfig_is_an_empty_patch() {
        let patch = gitconfig_identity(Path::new("/does/not/exist"));
        assert!(patch.is_empty());
    }
}
