//! In-container terminal multiplexer plugins.
//!
//! Each sandbox runs one multiplexer session named [`SESSION_NAME`] that the
//! gateway re-attaches clients to. The plugin supplies everything the rest of
//! the engine needs: packages to install, the first-start init script, the
//! attach command for SSH clients, probe/window-list invocations, and the
//! host config files to expose read-only inside the container.

mod tmux;
mod wezterm;

use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;

use crate::contrib::Contributor;
use crate::contrib::Mount;
use crate::contrib::MountContributor;
use crate::contrib::MountRequest;
use crate::contrib::Package;
use crate::contrib::PackageContributor;
use crate::contrib::PromptContributor;
use crate::contrib::PromptFragment;
use crate::error::Result;

/// Session name shared by every sandbox.
pub const SESSION_NAME: &str = "forage";

/// One window created by the init script at first start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    pub name: String,
    /// Command typed into the window after creation. `None` leaves a shell.
    pub command: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Multiplexer {
    #[default]
    Tmux,
    Wezterm,
}

impl Multiplexer {
    pub fn type_id(self) -> &'static str {
        match self {
            Multiplexer::Tmux => "tmux",
            Multiplexer::Wezterm => "wezterm",
        }
    }

    pub fn packages_needed(self) -> &'static [&'static str] {
        match self {
            Multiplexer::Tmux => &["tmux"],
            Multiplexer::Wezterm => &["wezterm"],
        }
    }

    pub fn prompt_instructions(self) -> &'static str {
        match self {
            Multiplexer::Tmux => {
                "The terminal runs inside a tmux session named `forage`. \
                 Long-running commands belong in their own tmux window."
            }
            Multiplexer::Wezterm => {
                "The terminal runs under wezterm-mux-server; clients attach \
                 with the native wezterm client."
            }
        }
    }

    /// Shell fragment run inside the container at first start. Creates the
    /// `forage` session and populates the requested windows; every
    /// interpolated value is shell-quoted.
    pub fn init_script(self, windows: &[WindowSpec]) -> String {
        match self {
            Multiplexer::Tmux => tmux::init_script(windows),
            Multiplexer::Wezterm => wezterm::init_script(windows),
        }
    }

    /// Remote command an SSH client runs to join the session, or `None` when
    /// the multiplexer uses a native client path instead of SSH attach.
    pub fn attach_command(self, control_mode: bool) -> Option<String> {
        match self {
            Multiplexer::Tmux => Some(tmux::attach_command(control_mode)),
            Multiplexer::Wezterm => None,
        }
    }

    /// Argv probing whether the session exists (exit code only).
    pub fn check_session_args(self) -> Vec<String> {
        match self {
            Multiplexer::Tmux => tmux::check_session_args(),
            Multiplexer::Wezterm => wezterm::check_session_args(),
        }
    }

    /// Argv listing the session's windows.
    pub fn list_windows_args(self) -> Vec<String> {
        match self {
            Multiplexer::Tmux => tmux::list_windows_args(),
            Multiplexer::Wezterm => wezterm::list_windows_args(),
        }
    }

    /// Window names out of the raw `list_windows` output.
    pub fn parse_window_list(self, text: &str) -> Vec<String> {
        match self {
            Multiplexer::Tmux => tmux::parse_window_list(text),
            Multiplexer::Wezterm => wezterm::parse_window_list(text),
        }
    }

    /// Host multiplexer config exposed read-only at the container's agent
    /// home, so the session inside looks like the user's own.
    pub fn host_config_mounts(self, host_home: &Path, container_home: &Path) -> Vec<Mount> {
        match self {
            Multiplexer::Tmux => tmux::host_config_mounts(host_home, container_home),
            Multiplexer::Wezterm => wezterm::host_config_mounts(host_home, container_home),
        }
    }
}

impl MountContributor for Multiplexer {
    fn mounts(&self, request: &MountRequest) -> Result<Vec<Mount>> {
        Ok(self.host_config_mounts(&request.host_home_dir, &request.container_home_dir))
    }
}

impl PackageContributor for Multiplexer {
    fn packages(&self) -> Result<Vec<Package>> {
        Ok(self
            .packages_needed()
            .iter()
            .map(|name| Package::from(*name))
            .collect())
    }
}

impl PromptContributor for Multiplexer {
    fn prompt_fragments(&self) -> Result<Vec<PromptFragment>> {
        Ok(vec![PromptFragment {
            section: "terminal".to_string(),
            priority: 50,
            content: self.prompt_instructions().to_string(),
        }])
    }
}

impl Contributor for Multiplexer {
    fn as_mount_contributor(&self) -> Option<&dyn MountContributor> {
        Some(self)
    }
    fn as_package_contributor(&self) -> Option<&dyn PackageContributor> {
        Some(self)
    }
    fn as_prompt_contributor(&self) -> Option<&dyn PromptContributor> {
        Some(self)
    }
}

/// First WezTerm release whose tmux control-mode handling is usable:
/// 2025-03-08.
fn control_mode_min_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 8).unwrap_or_default()
}

/// True when the connecting terminal can host tmux control mode: WezTerm,
/// recent enough. Reads `TERM_PROGRAM` and `TERM_PROGRAM_VERSION`.
pub fn host_supports_control_mode() -> bool {
    if std::env::var("TERM_PROGRAM").as_deref() != Ok("WezTerm") {
        return false;
    }
    std::env::var("TERM_PROGRAM_VERSION")
        .map(|v| version_supports_control_mode(&v))
        .unwrap_or(false)
}

/// Parse a WezTerm version and decide control-mode support.
///
/// Stable builds look like `20250308-093810-1a2b3c4d`, unstable/nightly
/// builds like `20250308_093810_1a2b3c4d`. Anything else is rejected; a
/// matching version qualifies iff its date is on or after 2025-03-08.
pub fn version_supports_control_mode(version: &str) -> bool {
    let Some(date) = parse_wezterm_version_date(version) else {
        return false;
    };
    date >= control_mode_min_date()
}

fn parse_wezterm_version_date(version: &str) -> Option<NaiveDate> {
    let separator = match version.as_bytes().get(8) {
        Some(b'-') => '-',
        Some(b'_') => '_',
        _ => return None,
    };
    let mut parts = version.split(separator);
    let date = parts.next()?;
    let time = parts.next()?;
    if time.len() != 6 || !time.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // The trailing hash is optional (stable releases sometimes omit it) but
    // must be alphanumeric when present.
    match parts.next() {
        None => {}
        Some(hash)
            if !hash.is_empty() && hash.bytes().all(|b| b.is_ascii_alphanumeric()) => {}
        Some(_) => return None,
    }
    if parts.next().is_some() {
        return None;
    }
    NaiveDate::parse_from_str(date, "%Y%m%d").ok()
}
