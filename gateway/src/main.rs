//! Entry-point for the `forage-gateway` binary.
//!
//! Installed as the SSH ForceCommand on the host: the sandbox name arrives
//! either as the single positional argument or in `SSH_ORIGINAL_COMMAND`.
//! With neither, the picker runs. Exit code is non-zero when the named
//! sandbox is invalid, missing, or not running.

use anyhow::Result;
use clap::Parser;
use forage_core::host_config::HostConfig;
use forage_core::paths::Paths;
use forage_gateway::Picker;
use forage_gateway::SandboxSummary;
use forage_gateway::dispatch;
use forage_gateway::parse_ssh_original_command;
use supports_color::Stream;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Route an SSH client to its sandbox")]
struct Cli {
    /// Sandbox to attach to. Falls back to `SSH_ORIGINAL_COMMAND`.
    name: Option<String>,
}

/// Stand-in for the interactive picker: print what exists and decline to
/// choose. The TUI picker ships separately and implements the same trait.
struct ListingPicker;

impl Picker for ListingPicker {
    fn pick(&self, sandboxes: &[SandboxSummary]) -> Result<Option<String>> {
        if sandboxes.is_empty() {
            eprintln!("no sandboxes exist; create one with `forage create`");
            return Ok(None);
        }
        eprintln!("specify a sandbox to attach to:");
        for sandbox in sandboxes {
            eprintln!("  {}\t{}", sandbox.name, sandbox.group);
        }
        Ok(None)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("error"))
        .unwrap_or_else(|_| EnvFilter::new("error"));
    tracing_subscriber::fmt()
        .with_ansi(supports_color::on_cached(Stream::Stderr).is_some())
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .init();

    let cli = Cli::parse();
    let name = cli.name.or_else(|| {
        std::env::var("SSH_ORIGINAL_COMMAND")
            .ok()
            .and_then(|command| parse_ssh_original_command(&command))
    });

    let paths = Paths::resolve()?;
    let host_config = HostConfig::load(&paths)?;
    let cancel = CancellationToken::new();
    dispatch(name, &paths, &host_config, &ListingPicker, &cancel).await
}
