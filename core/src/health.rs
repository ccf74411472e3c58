//! Sandbox health: container state, SSH reachability, multiplexer session.

use chrono::DateTime;
use chrono::NaiveDateTime;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::metadata::SandboxMetadata;
use crate::runtime::ContainerStatus;
use crate::runtime::Runtime;
use crate::ssh::SshCommand;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckResult {
    pub container_running: bool,
    pub ssh_reachable: bool,
    pub mux_active: bool,
    /// Formatted uptime (`45m`, `2h 30m`, …); an unparseable engine
    /// timestamp passes through raw.
    pub uptime: Option<String>,
    pub mux_windows: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryStatus {
    Healthy,
    /// Running but unreachable over SSH.
    Unhealthy,
    /// Reachable but no multiplexer session.
    NoMux,
    Stopped,
}

impl SummaryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SummaryStatus::Healthy => "healthy",
            SummaryStatus::Unhealthy => "unhealthy",
            SummaryStatus::NoMux => "no-mux",
            SummaryStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SummaryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probe the sandbox outside-in, short-circuiting at the first dead layer:
/// a stopped container cannot be SSH-reachable, an unreachable one cannot
/// answer a session probe.
pub async fn check(
    metadata: &SandboxMetadata,
    runtime: &dyn Runtime,
    cancel: &CancellationToken,
) -> Result<CheckResult> {
    let mut result = CheckResult::default();

    let info = runtime.status(&metadata.container_name, cancel).await?;
    result.container_running = info.status == ContainerStatus::Running;
    result.uptime = info.started_at.as_deref().map(format_uptime);
    if !result.container_running {
        return Ok(result);
    }

    let ssh = SshCommand::new(metadata.container_ip());
    result.ssh_reachable = ssh.probe(cancel).await;
    if !result.ssh_reachable {
        return Ok(result);
    }

    let mux = metadata.multiplexer;
    let probe = shell_join(&mux.check_session_args());
    let session = ssh
        .clone()
        .batch_mode(true)
        .remote_command(&probe)
        .run(cancel)
        .await?;
    result.mux_active = session.success();
    if result.mux_active {
        let listing = ssh
            .batch_mode(true)
            .remote_command(shell_join(&mux.list_windows_args()))
            .run(cancel)
            .await?;
        if listing.success() {
            result.mux_windows = mux.parse_window_list(&listing.stdout);
        }
    }
    Ok(result)
}

pub fn summary(result: &CheckResult) -> SummaryStatus {
    if !result.container_running {
        SummaryStatus::Stopped
    } else if !result.ssh_reachable {
        SummaryStatus::Unhealthy
    } else if !result.mux_active {
        SummaryStatus::NoMux
    } else {
        SummaryStatus::Healthy
    }
}

fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|word| {
            shlex::try_quote(word)
                .map(std::borrow::Cow::into_owned)
                .unwrap_or_else(|_| word.clone())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format "started at" as an uptime. Engines disagree on timestamp shape, so
/// parsing accepts a closed list of forms and passes anything else through
/// unchanged rather than failing the whole check.
pub fn format_uptime(started_at: &str) -> String {
    match parse_started_at(started_at) {
        Some(started) => {
            let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
            forage_utils_elapsed::format_elapsed(elapsed)
        }
        None => started_at.to_string(),
    }
}

fn parse_started_at(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    // RFC 3339, docker/podman style.
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Bare `YYYY-mm-dd HH:MM:SS`, taken as UTC.
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    // machinectl: `Tue 2026-07-28 10:15:00 UTC`. The zone abbreviation is
    // not reliably parseable, so the timestamp is taken as UTC.
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if let [_weekday, date, time, _zone] = tokens.as_slice()
        && let Ok(naive) = NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S")
    {
        return Some(naive.and_utc());
    }
    None
}
