//! Built-in contributors that are not tied to another subsystem: the
//! reproducibility base, the workspace mount, proxy env, tmpfiles rules, and
//! the in-container identity file.

use std::path::PathBuf;

use super::Contributor;
use super::EnvVarContributor;
use super::EnvVarRequest;
use super::GeneratedFile;
use super::GeneratedFileContributor;
use super::GeneratedFileRequest;
use super::Mount;
use super::MountContributor;
use super::MountRequest;
use super::Package;
use super::PackageContributor;
use super::TmpfilesContributor;
use super::TmpfilesRequest;
use crate::error::Result;
use crate::paths::CONTAINER_WORKSPACE_DIR;

/// Packages every sandbox needs regardless of template.
const BASE_PACKAGES: &[&str] = &["git", "openssh", "coreutils"];

/// Nix store bind plus the base package set. The store mount keeps container
/// closures identical to the host's.
pub struct ReproducibilityContributor {
    nix_store_path: PathBuf,
    base_packages: Vec<String>,
}

impl ReproducibilityContributor {
    pub fn new(base_packages: Vec<String>) -> Self {
        Self {
            nix_store_path: PathBuf::from("/nix/store"),
            base_packages,
        }
    }
}

impl MountContributor for ReproducibilityContributor {
    fn mounts(&self, _request: &MountRequest) -> Result<Vec<Mount>> {
        if self.nix_store_path.is_dir() {
            Ok(vec![Mount::read_only(
                self.nix_store_path.clone(),
                self.nix_store_path.clone(),
            )])
        } else {
            Ok(Vec::new())
        }
    }
}

impl PackageContributor for ReproducibilityContributor {
    fn packages(&self) -> Result<Vec<Package>> {
        let mut packages: Vec<Package> =
            BASE_PACKAGES.iter().map(|name| Package::from(*name)).collect();
        packages.extend(self.base_packages.iter().cloned().map(Package::from));
        Ok(packages)
    }
}

impl Contributor for ReproducibilityContributor {
    fn as_mount_contributor(&self) -> Option<&dyn MountContributor> {
        Some(self)
    }
    fn as_package_contributor(&self) -> Option<&dyn PackageContributor> {
        Some(self)
    }
}

/// The workspace bind mount. With no explicit set, the request's workspace
/// path lands at `/workspace`; a template multi-mount set replaces that with
/// its resolved mounts.
pub struct WorkspaceContributor {
    mounts: Option<Vec<Mount>>,
}

impl WorkspaceContributor {
    /// Legacy single-mount form.
    pub fn single() -> Self {
        Self { mounts: None }
    }

    /// Multi-mount form with the creator's resolved mount list.
    pub fn multi(mounts: Vec<Mount>) -> Self {
        Self {
            mounts: Some(mounts),
        }
    }
}

impl MountContributor for WorkspaceContributor {
    fn mounts(&self, request: &MountRequest) -> Result<Vec<Mount>> {
        match &self.mounts {
            Some(mounts) => Ok(mounts.clone()),
            None => Ok(vec![Mount {
                host_path: request.workspace_path.clone(),
                container_path: PathBuf::from(CONTAINER_WORKSPACE_DIR),
                read_only: request.read_only_workspace,
            }]),
        }
    }
}

impl Contributor for WorkspaceContributor {
    fn as_mount_contributor(&self) -> Option<&dyn MountContributor> {
        Some(self)
    }
}

/// Proxy env vars, both spellings. Inactive when the request carries no
/// proxy URL (either the host has none or the template opted out).
pub struct ProxyContributor;

impl EnvVarContributor for ProxyContributor {
    fn env_vars(&self, request: &EnvVarRequest) -> Result<Vec<(String, String)>> {
        let Some(url) = &request.proxy_url else {
            return Ok(Vec::new());
        };
        Ok(vec![
            ("HTTP_PROXY".to_string(), url.clone()),
            ("HTTPS_PROXY".to_string(), url.clone()),
            ("http_proxy".to_string(), url.clone()),
            ("https_proxy".to_string(), url.clone()),
            ("NO_PROXY".to_string(), "localhost,127.0.0.1".to_string()),
        ])
    }
}

impl Contributor for ProxyContributor {
    fn as_env_var_contributor(&self) -> Option<&dyn EnvVarContributor> {
        Some(self)
    }
}

/// Home-directory skeleton every sandbox gets.
pub struct BaseTmpfilesContributor;

impl TmpfilesContributor for BaseTmpfilesContributor {
    fn tmpfiles_rules(&self, request: &TmpfilesRequest) -> Result<Vec<String>> {
        let home = request.home_dir.display();
        let user = &request.username;
        Ok(vec![
            format!("d {home} 0755 {user} {user} -"),
            format!("d {home}/.ssh 0700 {user} {user} -"),
            format!("d {home}/.config 0755 {user} {user} -"),
        ])
    }
}

impl Contributor for BaseTmpfilesContributor {
    fn as_tmpfiles_contributor(&self) -> Option<&dyn TmpfilesContributor> {
        Some(self)
    }
}

/// Claude-specific state directories, so first launch inside the container
/// does not trip over a read-only home skeleton.
pub struct ClaudeTmpfilesContributor;

impl TmpfilesContributor for ClaudeTmpfilesContributor {
    fn tmpfiles_rules(&self, request: &TmpfilesRequest) -> Result<Vec<String>> {
        let home = request.home_dir.display();
        let user = &request.username;
        Ok(vec![
            format!("d {home}/.claude 0755 {user} {user} -"),
            format!("d {home}/.claude/projects 0755 {user} {user} -"),
            format!("d {home}/.config/claude 0755 {user} {user} -"),
        ])
    }
}

impl Contributor for ClaudeTmpfilesContributor {
    fn as_tmpfiles_contributor(&self) -> Option<&dyn TmpfilesContributor> {
        Some(self)
    }
}

/// `/etc/forage.json`: the sandbox's own name and template, readable from
/// inside. The nspawn list fallback uses it to recover sandbox names for
/// machines whose name matches no persisted metadata.
pub struct MetadataFileContributor;

impl GeneratedFileContributor for MetadataFileContributor {
    fn generated_files(&self, request: &GeneratedFileRequest) -> Result<Vec<GeneratedFile>> {
        let body = serde_json::json!({
            "name": request.sandbox_name,
            "workspace": CONTAINER_WORKSPACE_DIR,
        });
        Ok(vec![GeneratedFile {
            container_path: PathBuf::from(crate::runtime::nspawn::CONTAINER_METADATA_PATH),
            content: serde_json::to_vec_pretty(&body)?,
            mode: 0o644,
            read_only: true,
        }])
    }
}

impl Contributor for MetadataFileContributor {
    fn as_generated_file_contributor(&self) -> Option<&dyn GeneratedFileContributor> {
        Some(self)
    }
}
