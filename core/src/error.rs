use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, ForageErr>;

/// Error taxonomy for the sandbox lifecycle engine.
///
/// `BackendFailure` wraps child-process failures verbatim so callers can
/// surface the underlying tool's exit code and stderr without re-running it.
#[derive(Debug, thiserror::Error)]
pub enum ForageErr {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("no free network slot in 1..254")]
    NoSlotsAvailable,

    #[error("{backend} {op} failed: {stderr}")]
    BackendFailure {
        backend: String,
        op: String,
        exit: Option<i32>,
        stderr: String,
    },

    #[error("two mounts share container path {}", .container_path.display())]
    MountConflict { container_path: PathBuf },

    #[error("timed out after {0:?} while {1}")]
    Timeout(Duration, String),

    #[error("generated file path {} escapes the staging directory", .0.display())]
    StagingEscape(PathBuf),

    #[error("refusing to write through symlink at {}", .0.display())]
    SymlinkRefusal(PathBuf),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl ForageErr {
    /// Shorthand for wrapping a failed child process.
    pub fn backend(backend: &str, op: &str, exit: Option<i32>, stderr: impl Into<String>) -> Self {
        let stderr: String = stderr.into();
        // Keep only a short excerpt so the error stays printable on one line.
        let excerpt = stderr
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap_or_default()
            .trim()
            .to_string();
        Self::BackendFailure {
            backend: backend.to_string(),
            op: op.to_string(),
            exit,
            stderr: excerpt,
        }
    }

    /// True when a backend failure says the target did not exist. Teardown
    /// paths treat that as success so destroy stays idempotent.
    pub fn is_absent_target(&self) -> bool {
        match self {
            Self::BackendFailure { stderr, .. } => {
                let stderr = stderr.to_lowercase();
                stderr.contains("not found") || stderr.contains("no such")
            }
            _ => false,
        }
    }
}

impl From<toml::de::Error> for ForageErr {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_failure_keeps_the_first_meaningful_line() {
        let err = ForageErr::backend("nspawn", "destroy", Some(1), "\nError: not found\ndetail");
        assert!(matches!(
            &err,
            ForageErr::BackendFailure { stderr, .. } if stderr == "Error: not found"
        ));
    }

    #[test]
    fn absent_target_matches_tool_phrasings() {
        let gone = ForageErr::backend("nspawn", "destroy", Some(1), "container forage-3 not found");
        assert!(gone.is_absent_target());
        let docker_gone = ForageErr::backend("docker", "destroy", Some(1), "No such container: x");
        assert!(docker_gone.is_absent_target());
        let real = ForageErr::backend("nspawn", "destroy", Some(1), "permission denied");
        assert!(!real.is_absent_target());
        assert!(!ForageErr::Cancelled.is_absent_target());
    }
}

impl From<serde_json::Error> for ForageErr {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(err.to_string())
    }
}
