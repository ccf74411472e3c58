use std::path::Path;

use super::WindowSpec;
use crate::contrib::Mount;
use crate::paths::CONTAINER_WORKSPACE_DIR;

fn quote(word: &str) -> String {
    shlex::try_quote(word)
        .map(std::borrow::Cow::into_owned)
        .unwrap_or_else(|_| word.to_string())
}

/// First-start fragment: bring up the mux server, then spawn one tab per
/// window spec. WezTerm has no session rename, so window names become tab
/// titles via the spawned command.
pub(super) fn init_script(windows: &[WindowSpec]) -> String {
    let mut lines = vec!["wezterm-mux-server --daemonize".to_string()];
    for window in windows {
        let command = window.command.as_deref().unwrap_or("$SHELL");
        lines.push(format!(
            "wezterm cli spawn --cwd {CONTAINER_WORKSPACE_DIR} -- sh -c {}",
            quote(&format!(
                "printf '\\033]2;%s\\033\\\\' {}; {command}",
                quote(&window.name)
            ))
        ));
    }
    lines.join("\n")
}

pub(super) fn check_session_args() -> Vec<String> {
    vec!["wezterm".to_string(), "cli".to_string(), "list".to_string()]
}

pub(super) fn list_windows_args() -> Vec<String> {
    vec![
        "wezterm".to_string(),
        "cli".to_string(),
        "list".to_string(),
        "--format".to_string(),
        "json".to_string(),
    ]
}

/// `wezterm cli list --format json` emits one entry per pane; tab titles are
/// the closest analogue of window names.
pub(super) fn parse_window_list(text: &str) -> Vec<String> {
    let Ok(entries) = serde_json::from_str::<Vec<serde_json::Value>>(text) else {
        return Vec::new();
    };
    let mut names = Vec::new();
    for entry in entries {
        if let Some(title) = entry.get("tab_title").and_then(|t| t.as_str())
            && !title.is_empty()
            && !names.iter().any(|n| n == title)
        {
            names.push(title.to_string());
        }
    }
    names
}

/// `~/.config/wezterm` and `~/.wezterm.lua`, whichever exist, exposed
/// read-only at the agent's home.
pub(super) fn host_config_mounts(host_home: &Path, container_home: &Path) -> Vec<Mount> {
    let mut mounts = Vec::new();
    let config_dir = host_home.join(".config/wezterm");
    if config_dir.is_dir() {
        mounts.push(Mount::read_only(
            config_dir,
            container_home.join(".config/wezterm"),
        ));
    }
    let lua = host_home.join(".wezterm.lua");
    if lua.is_file() {
        mounts.push(Mount::read_only(lua, container_home.join(".wezterm.lua")));
    }
    mounts
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn init_script_starts_the_mux_server_first() {
        let script = init_script(&[WindowSpec {
            name: "agent".to_string(),
            command: Some("claude".to_string()),
        }]);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "wezterm-mux-server --daemonize");
        assert!(lines[1].starts_with("wezterm cli spawn --cwd /workspace -- sh -c "));
    }

    #[test]
    fn window_list_collects_unique_tab_titles() {
        let json = r#"[
            {"window_id": 0, "tab_id": 0, "tab_title": "agent"},
            {"window_id": 0, "tab_id": 0, "tab_title": "agent"},
            {"window_id": 0, "tab_id": 1, "tab_title": "logs"}
        ]"#;
        assert_eq!(parse_window_list(json), vec!["agent", "logs"]);
        assert!(parse_window_list("not json").is_empty());
    }
}
