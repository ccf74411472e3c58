//! Health checks against the fake runtime. SSH and multiplexer layers are
//! exercised as far as an offline host allows: a running container with no
//! reachable sshd must summarize as unhealthy.

use chrono::Utc;
use forage_core::SandboxMetadata;
use forage_core::health;
use forage_core::health::SummaryStatus;
use forage_core::metadata::AgentIdentity;
use forage_core::mux::Multiplexer;
use forage_core::vcs::WorkspaceMode;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::fake_runtime::FakeRuntime;

fn metadata(name: &str, slot: u8) -> SandboxMetadata {
    SandboxMetadata {
        name: name.to_string(),
        template: "default".to_string(),
        network_slot: slot,
        created_at: Utc::now(),
        container_name: format!("forage-{slot}"),
        runtime: "fake".to_string(),
        multiplexer: Multiplexer::Tmux,
        workspace: "/work".into(),
        workspace_mode: WorkspaceMode::Direct,
        source_repo: None,
        git_branch: None,
        agent_identity: AgentIdentity {
            git_user: "agent".to_string(),
            git_email: "agent@example.com".to_string(),
            ssh_key_path: None,
        },
        workspace_mounts: None,
    }
}

#[tokio::test]
async fn absent_container_summarizes_as_stopped() {
    let runtime = FakeRuntime::new();
    let cancel = CancellationToken::new();
    let result = health::check(&metadata("ghost", 9), &runtime, &cancel)
        .await
        .expect("check");
    assert!(!result.container_running);
    assert_eq!(health::summary(&result), SummaryStatus::Stopped);
    // Short-circuited: no SSH or mux probing happened.
    assert!(!result.ssh_reachable);
    assert!(result.mux_windows.is_empty());
}

#[tokio::test]
async fn running_but_unreachable_summarizes_as_unhealthy() {
    let runtime = FakeRuntime::with_running("forage-9");
    let cancel = CancellationToken::new();
    let result = health::check(&metadata("orphan", 9), &runtime, &cancel)
        .await
        .expect("check");
    assert!(result.container_running);
    assert!(!result.ssh_reachable);
    assert_eq!(health::summary(&result), SummaryStatus::Unhealthy);
}
