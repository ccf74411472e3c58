//! Filtered environment for process replacement.
//!
//! When the gateway or an interactive exec replaces the current process with
//! `ssh`, it must not leak the caller's full environment into the session:
//! cloud and API credentials commonly live in environment variables. Only a
//! fixed allow-list of terminal, locale, desktop, and Nix variables survives.

use std::collections::HashMap;

/// Variables retained by exact name.
const RETAINED_NAMES: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TERM",
    "LANG",
    "LANGUAGE",
    "DISPLAY",
    "WAYLAND_DISPLAY",
    "SSH_AUTH_SOCK",
    "DBUS_SESSION_BUS_ADDRESS",
    "TMPDIR",
    "TMP",
    "TEMP",
    "COLORTERM",
    "COLORFGBG",
    "NO_COLOR",
    "FORCE_COLOR",
    "EDITOR",
    "VISUAL",
    "PAGER",
    "HOSTNAME",
    "HOSTTYPE",
    "OSTYPE",
    "IN_NIX_SHELL",
];

/// Variables retained by prefix.
const RETAINED_PREFIXES: &[&str] = &["LC_", "XDG_", "NIX_"];

/// The current process environment reduced to the allow-list. The result can
/// be handed to `Command::envs` after `env_clear`, or to
/// [`crate::spawn::replace_process`].
pub fn filtered_env() -> HashMap<String, String> {
    filter_env(std::env::vars())
}

fn filter_env<I>(vars: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(name, _)| {
            RETAINED_NAMES.contains(&name.as_str())
                || RETAINED_PREFIXES
                    .iter()
                    .any(|prefix| name.starts_with(prefix))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn credentials_are_dropped() {
        let filtered = filter_env(vars(&[
            ("PATH", "/usr/bin"),
            ("AWS_SECRET_ACCESS_KEY", "hunter2"),
            ("ANTHROPIC_API_KEY", "sk-…"),
            ("GITHUB_TOKEN", "ghp_…"),
            ("HOME", "/home/user"),
        ]));
        assert_eq!(filtered.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(filtered.get("HOME").map(String::as_str), Some("/home/user"));
        assert!(!filtered.contains_key("AWS_SECRET_ACCESS_KEY"));
        assert!(!filtered.contains_key("ANTHROPIC_API_KEY"));
        assert!(!filtered.contains_key("GITHUB_TOKEN"));
    }

    #[test]
    fn prefix_families_survive() {
        let filtered = filter_env(vars(&[
            ("LC_ALL", "en_US.UTF-8"),
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
            ("NIX_PATH", "nixpkgs=/nix/store/…"),
            ("LCX", "not-a-prefix-match"),
        ]));
        assert_eq!(filtered.len(), 3);
        assert!(filtered.contains_key("LC_ALL"));
        assert!(filtered.contains_key("XDG_RUNTIME_DIR"));
        assert!(filtered.contains_key("NIX_PATH"));
    }
}
