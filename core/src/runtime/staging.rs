//! Symlink-safe staging of generated files.
//!
//! Generated files are written under the per-sandbox staging directory and
//! bind-mounted into the container. The container path is attacker-adjacent
//! input (templates and contributors compose it), so staging refuses any
//! resolved path outside the staging root and never writes through a
//! symlink: resolve first, then open create-exclusive or truncate an
//! already-verified regular file.

use std::fs::OpenOptions;
use std::os::unix::fs::PermissionsExt;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::contrib::GeneratedFile;
use crate::contrib::Mount;
use crate::error::ForageErr;
use crate::error::Result;

/// Stage `file.content` under `staging_root`, returning the mount exposing
/// it at the requested container path.
pub(crate) fn stage_generated_file(staging_root: &Path, file: &GeneratedFile) -> Result<Mount> {
    let relative = container_path_relative(&file.container_path)?;
    let target = staging_root.join(&relative);
    let target_dir = target
        .parent()
        .ok_or_else(|| ForageErr::StagingEscape(file.container_path.clone()))?;
    std::fs::create_dir_all(target_dir)?;

    // Resolve both sides before trusting the containment relation: a symlink
    // planted inside the staging tree must not redirect the write.
    let resolved_dir = target_dir.canonicalize()?;
    let resolved_root = staging_root.canonicalize()?;
    if !resolved_dir.starts_with(&resolved_root) {
        return Err(ForageErr::StagingEscape(file.container_path.clone()));
    }

    let file_name = target
        .file_name()
        .ok_or_else(|| ForageErr::StagingEscape(file.container_path.clone()))?;
    let resolved_target = resolved_dir.join(file_name);

    let handle = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&resolved_target)
    {
        Ok(handle) => handle,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let existing = std::fs::symlink_metadata(&resolved_target)?;
            if existing.file_type().is_symlink() {
                return Err(ForageErr::SymlinkRefusal(resolved_target));
            }
            OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&resolved_target)?
        }
        Err(err) => return Err(err.into()),
    };
    use std::io::Write;
    let mut handle = handle;
    handle.write_all(&file.content)?;
    handle.set_permissions(std::fs::Permissions::from_mode(file.mode))?;
    drop(handle);

    Ok(Mount {
        host_path: resolved_target,
        container_path: file.container_path.clone(),
        read_only: file.read_only,
    })
}

/// The container path reduced to a safe relative path: a leading root is
/// stripped, and only normal components are allowed.
fn container_path_relative(container_path: &Path) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in container_path.components() {
        match component {
            Component::RootDir => {}
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ForageErr::StagingEscape(container_path.to_path_buf()));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(ForageErr::StagingEscape(container_path.to_path_buf()));
    }
    Ok(relative)
}
