//! SSH invocation wrapper.
//!
//! Every SSH call against a sandbox (captured exec, stdin-fed exec,
//! interactive session, process replacement, liveness probe) is built from
//! the same argv so option policy lives in exactly one place. Host keys are
//! not checked by default: containers are ephemeral and re-use IPs, so the
//! known-hosts file would poison itself on every recreation.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ForageErr;
use crate::error::Result;
use crate::exec_env;
use crate::spawn;
use crate::spawn::ExecResult;
use crate::spawn::RunOptions;

pub const DEFAULT_SSH_USER: &str = "agent";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SshCommand {
    user: String,
    host: String,
    strict_host_key_check: bool,
    connect_timeout: Duration,
    batch_mode: bool,
    request_tty: bool,
    remote_command: Option<String>,
}

impl SshCommand {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            user: DEFAULT_SSH_USER.to_string(),
            host: host.into(),
            strict_host_key_check: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            batch_mode: false,
            request_tty: false,
            remote_command: None,
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn strict_host_key_check(mut self, strict: bool) -> Self {
        self.strict_host_key_check = strict;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn batch_mode(mut self, batch: bool) -> Self {
        self.batch_mode = batch;
        self
    }

    pub fn request_tty(mut self, tty: bool) -> Self {
        self.request_tty = tty;
        self
    }

    pub fn remote_command(mut self, command: impl Into<String>) -> Self {
        self.remote_command = Some(command.into());
        self
    }

    /// The full argv, `ssh` included. Always ends with `user@host` followed
    /// by the remote command verbatim when one is set.
    pub fn build_argv(&self) -> Vec<String> {
        let mut argv = vec!["ssh".to_string()];
        if !self.strict_host_key_check {
            argv.push("-o".to_string());
            argv.push("StrictHostKeyChecking=no".to_string());
            argv.push("-o".to_string());
            argv.push("UserKnownHostsFile=/dev/null".to_string());
        }
        argv.push("-o".to_string());
        argv.push(format!(
            "ConnectTimeout={}",
            self.connect_timeout.as_secs().max(1)
        ));
        if self.batch_mode {
            argv.push("-o".to_string());
            argv.push("BatchMode=yes".to_string());
        }
        if self.request_tty {
            argv.push("-t".to_string());
        }
        argv.push(format!("{}@{}", self.user, self.host));
        if let Some(command) = &self.remote_command {
            argv.push(command.clone());
        }
        argv
    }

    /// Run the SSH command and capture its output.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ExecResult> {
        let argv = self.build_argv();
        spawn::run_captured(&argv[0], &argv[1..], &RunOptions::default(), cancel).await
    }

    /// Run the SSH command feeding `stdin` to the remote side.
    pub async fn run_with_stdin(
        &self,
        stdin: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        let argv = self.build_argv();
        let options = RunOptions {
            stdin: Some(stdin),
            ..Default::default()
        };
        spawn::run_captured(&argv[0], &argv[1..], &options, cancel).await
    }

    /// Run interactively, inheriting the caller's stdio. Returns the remote
    /// exit code.
    pub async fn interactive(&self, cancel: &CancellationToken) -> Result<i32> {
        let argv = self.build_argv();
        spawn::run_inherited(&argv[0], &argv[1..], None, cancel).await
    }

    /// Replace the current process with the SSH client. Passes the filtered
    /// environment, never the inherited one. Returns only on failure.
    pub fn replace_process(&self) -> ForageErr {
        self.replace_process_with_env(&exec_env::filtered_env())
    }

    pub fn replace_process_with_env(&self, env: &HashMap<String, String>) -> ForageErr {
        let argv = self.build_argv();
        spawn::replace_process(&argv[0], &argv[1..], env)
    }

    /// Liveness probe: `ssh … true` in batch mode. Success or failure only.
    pub async fn probe(&self, cancel: &CancellationToken) -> bool {
        let probe = self
            .clone()
            .batch_mode(true)
            .request_tty(false)
            .remote_command("true");
        match probe.run(cancel).await {
            Ok(result) => result.success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn argv_ends_with_target_then_command() {
        let argv = SshCommand::new("10.100.5.2")
            .remote_command("tmux attach-session -t forage")
            .build_argv();
        let n = argv.len();
        assert_eq!(argv[n - 2], "agent@10.100.5.2");
        assert_eq!(argv[n - 1], "tmux attach-session -t forage");
    }

    #[test]
    fn default_options_disable_host_key_checks() {
        let argv = SshCommand::new("10.100.1.2").build_argv();
        assert_eq!(
            argv,
            vec![
                "ssh",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "ConnectTimeout=2",
                "agent@10.100.1.2",
            ]
        );
    }

    #[test]
    fn strict_mode_drops_the_overrides() {
        let argv = SshCommand::new("10.100.1.2")
            .strict_host_key_check(true)
            .build_argv();
        assert!(!argv.iter().any(|a| a.starts_with("StrictHostKeyChecking")));
        assert!(!argv.iter().any(|a| a.starts_with("UserKnownHostsFile")));
    }

    #[test]
    fn batch_mode_adds_exactly_one_flag() {
        let argv = SshCommand::new("h").batch_mode(true).build_argv();
        let count = argv.iter().filter(|a| *a == "BatchMode=yes").count();
        assert_eq!(count, 1);
        let argv = SshCommand::new("h").build_argv();
        assert!(!argv.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn request_tty_adds_exactly_one_flag() {
        let argv = SshCommand::new("h").request_tty(true).build_argv();
        assert_eq!(argv.iter().filter(|a| *a == "-t").count(), 1);
    }

    #[test]
    fn custom_user_and_timeout() {
        let argv = SshCommand::new("h")
            .user("root")
            .connect_timeout(Duration::from_secs(10))
            .build_argv();
        assert!(argv.contains(&"ConnectTimeout=10".to_string()));
        assert_eq!(argv.last().map(String::as_str), Some("root@h"));
    }
}
