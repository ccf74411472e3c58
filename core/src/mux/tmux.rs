use std::path::Path;

use super::SESSION_NAME;
use super::WindowSpec;
use crate::contrib::Mount;
use crate::paths::CONTAINER_WORKSPACE_DIR;

fn quote(word: &str) -> String {
    shlex::try_quote(word)
        .map(std::borrow::Cow::into_owned)
        // try_quote only fails on interior NUL, which cannot survive a shell
        // line anyway; fall back to the raw word.
        .unwrap_or_else(|_| word.to_string())
}

/// Shell fragment creating the `forage` session with one window per spec.
/// Window zero reuses the window created by `new-session`.
pub(super) fn init_script(windows: &[WindowSpec]) -> String {
    let mut lines = vec![format!(
        "tmux new-session -d -s {SESSION_NAME} -c {CONTAINER_WORKSPACE_DIR}"
    )];
    for (index, window) in windows.iter().enumerate() {
        if index == 0 {
            lines.push(format!(
                "tmux rename-window -t {SESSION_NAME}:0 {}",
                quote(&window.name)
            ));
        } else {
            lines.push(format!(
                "tmux new-window -t {SESSION_NAME} -n {} -c {CONTAINER_WORKSPACE_DIR}",
                quote(&window.name)
            ));
        }
        if let Some(command) = &window.command {
            lines.push(format!(
                "tmux send-keys -t {SESSION_NAME}:{index} {} Enter",
                quote(command)
            ));
        }
    }
    lines.join("\n")
}

/// Remote command joining (or creating) the session.
///
/// Control mode must issue exactly one tmux invocation over the wire, so the
/// branching uses a strict `if/then/else` rather than `||`, and never `exec`:
/// a double invocation breaks the control-mode protocol stream.
pub(super) fn attach_command(control_mode: bool) -> String {
    if control_mode {
        format!(
            "if tmux has-session -t {SESSION_NAME} 2>/dev/null; \
             then tmux -CC attach-session -t {SESSION_NAME}; \
             else tmux -CC new-session -s {SESSION_NAME} -c {CONTAINER_WORKSPACE_DIR}; fi"
        )
    } else {
        format!(
            "tmux attach-session -t {SESSION_NAME} || \
             tmux new-session -s {SESSION_NAME} -c {CONTAINER_WORKSPACE_DIR}"
        )
    }
}

pub(super) fn check_session_args() -> Vec<String> {
    vec![
        "tmux".to_string(),
        "has-session".to_string(),
        "-t".to_string(),
        SESSION_NAME.to_string(),
    ]
}

pub(super) fn list_windows_args() -> Vec<String> {
    vec![
        "tmux".to_string(),
        "list-windows".to_string(),
        "-t".to_string(),
        SESSION_NAME.to_string(),
        "-F".to_string(),
        "#{window_index}:#{window_name}".to_string(),
    ]
}

pub(super) fn parse_window_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split_once(':').map(|(_, name)| name.to_string()))
        .filter(|name| !name.is_empty())
        .collect()
}

/// `~/.config/tmux` and `~/.tmux.conf`, whichever exist, exposed read-only
/// at the agent's home.
pub(super) fn host_config_mounts(host_home: &Path, container_home: &Path) -> Vec<Mount> {
    let mut mounts = Vec::new();
    let config_dir = host_home.join(".config/tmux");
    if config_dir.is_dir() {
        mounts.push(Mount::read_only(
            config_dir,
            container_home.join(".config/tmux"),
        ));
    }
    let conf = host_home.join(".tmux.conf");
    if conf.is_file() {
        mounts.push(Mount::read_only(conf, container_home.join(".tmux.conf")));
    }
    mounts
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn attach_command_matches_the_gateway_contract() {
        assert_eq!(
            attach_command(false),
            "tmux attach-session -t forage || tmux new-session -s forage -c /workspace"
        );
    }

    #[test]
    fn control_mode_uses_strict_branching_without_exec() {
        let command = attach_command(true);
        assert!(command.starts_with("if tmux has-session"));
        assert!(command.contains("-CC"));
        assert!(command.ends_with("fi"));
        assert!(!command.contains("exec"));
        assert!(!command.contains("||"));
    }

    #[test]
    fn init_script_quotes_window_commands() {
        let script = init_script(&[
            WindowSpec {
                name: "shell".to_string(),
                command: None,
            },
            WindowSpec {
                name: "agent".to_string(),
                command: Some("claude --message 'hello; world'".to_string()),
            },
        ]);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "tmux new-session -d -s forage -c /workspace");
        assert_eq!(lines[1], "tmux rename-window -t forage:0 shell");
        assert_eq!(lines[2], "tmux new-window -t forage -n agent -c /workspace");
        // The command survives as a single shell word.
        let quoted = lines[3]
            .strip_prefix("tmux send-keys -t forage:1 ")
            .and_then(|rest| rest.strip_suffix(" Enter"))
            .expect("send-keys line");
        let words = shlex::split(quoted).expect("splittable");
        assert_eq!(words, vec!["claude --message 'hello; world'"]);
    }

    #[test]
    fn window_list_parses_index_name_pairs() {
        let names = parse_window_list("0:shell\n1:agent\n2:logs\n");
        assert_eq!(names, vec!["shell", "agent", "logs"]);
        assert!(parse_window_list("").is_empty());
    }

    #[test]
    fn host_config_mounts_discover_existing_files() {
        let home = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(home.path().join(".config/tmux")).expect("mkdir");
        std::fs::write(home.path().join(".tmux.conf"), b"set -g mouse on\n").expect("write");
        let mounts = host_config_mounts(home.path(), Path::new("/home/agent"));
        assert_eq!(mounts.len(), 2);
        assert!(mounts.iter().all(|m| m.read_only));
        assert_eq!(
            mounts[1].container_path,
            Path::new("/home/agent/.tmux.conf")
        );
    }
}
