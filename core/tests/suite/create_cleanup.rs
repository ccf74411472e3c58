//! End-to-end creation and teardown against the fake runtime.

use std::path::Path;

use forage_core::ForageErr;
use forage_core::SandboxMetadata;
use forage_core::cleanup;
use forage_core::cleanup::CleanupOptions;
use forage_core::create;
use forage_core::create::CreateOptions;
use forage_core::paths::Paths;
use forage_core::paths::paths_under;
use forage_core::runtime::ContainerStatus;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::fake_runtime::FakeRuntime;

fn options(name: &str, workspace: &Path) -> CreateOptions {
    CreateOptions {
        name: name.to_string(),
        template: "default".to_string(),
        repo_path: Some(workspace.to_path_buf()),
        direct: true,
        git_user: Some("Test Agent".to_string()),
        git_email: Some("agent@example.com".to_string()),
        ..Default::default()
    }
}

fn setup() -> (TempDir, Paths, TempDir) {
    let state = TempDir::new().expect("state dir");
    let paths = paths_under(state.path());
    let workspace = TempDir::new().expect("workspace dir");
    (state, paths, workspace)
}

/// No file whose name mentions the sandbox survives under any state
/// directory.
fn assert_no_trace(paths: &Paths, name: &str) {
    for dir in [&paths.sandboxes_dir, &paths.workspaces_dir, &paths.secrets_dir] {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            assert!(
                !file_name.contains(name),
                "{} still contains {file_name}",
                dir.display()
            );
        }
    }
}

#[tokio::test]
async fn create_provisions_and_cleanup_removes_everything() {
    let (_state, paths, workspace) = setup();
    let runtime = FakeRuntime::new();
    let cancel = CancellationToken::new();

    let result = create::create(
        options("cleanup-test", workspace.path()),
        &Default::default(),
        &paths,
        &runtime,
        &cancel,
    )
    .await
    .expect("create");

    assert_eq!(result.name, "cleanup-test");
    assert_eq!(result.container_ip, "10.100.1.2");
    assert_eq!(result.metadata.network_slot, 1);
    assert_eq!(result.metadata.container_name, "forage-1");
    assert_eq!(runtime.state_of("forage-1"), ContainerStatus::Running);

    // Metadata, config blob, and staged identity file are on disk.
    assert!(SandboxMetadata::exists(&paths, "cleanup-test"));
    assert!(paths.config_blob_path("cleanup-test").exists());
    assert!(
        paths
            .generated_dir("cleanup-test")
            .join("etc/forage.json")
            .exists()
    );

    let metadata = SandboxMetadata::load(&paths, "cleanup-test").expect("load");
    assert_eq!(metadata, result.metadata);

    cleanup::cleanup(
        &metadata,
        &CleanupOptions::everything(),
        Some(&runtime),
        &paths,
        &cancel,
    )
    .await;

    assert_eq!(runtime.state_of("forage-1"), ContainerStatus::NotFound);
    assert_eq!(runtime.destroyed.lock().unwrap().as_slice(), ["forage-1"]);
    assert_no_trace(&paths, "cleanup-test");

    // Idempotent: a second cleanup over the same metadata is a no-op.
    cleanup::cleanup(
        &metadata,
        &CleanupOptions::everything(),
        Some(&runtime),
        &paths,
        &cancel,
    )
    .await;
    assert_no_trace(&paths, "cleanup-test");
}

#[tokio::test]
async fn invalid_names_are_rejected_without_touching_disk() {
    let (_state, paths, workspace) = setup();
    let runtime = FakeRuntime::new();
    let cancel = CancellationToken::new();

    for bad in ["", "../escape", "My-Project", "has spaces", "-starts-with-dash", "has;semicolon"] {
        let err = create::create(
            options(bad, workspace.path()),
            &Default::default(),
            &paths,
            &runtime,
            &cancel,
        )
        .await
        .expect_err("invalid name");
        assert!(matches!(err, ForageErr::InvalidInput(_)), "{bad:?}: {err}");
    }
    assert!(!paths.sandboxes_dir.exists() || std::fs::read_dir(&paths.sandboxes_dir).unwrap().next().is_none());
    assert!(runtime.states.lock().unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_names_collide() {
    let (_state, paths, workspace) = setup();
    let runtime = FakeRuntime::new();
    let cancel = CancellationToken::new();

    create::create(
        options("twice", workspace.path()),
        &Default::default(),
        &paths,
        &runtime,
        &cancel,
    )
    .await
    .expect("first create");
    let err = create::create(
        options("twice", workspace.path()),
        &Default::default(),
        &paths,
        &runtime,
        &cancel,
    )
    .await
    .expect_err("second create");
    assert!(matches!(err, ForageErr::AlreadyExists(_)));
}

#[tokio::test]
async fn slots_are_allocated_first_fit_across_sandboxes() {
    let (_state, paths, workspace) = setup();
    let runtime = FakeRuntime::new();
    let cancel = CancellationToken::new();

    for name in ["box-a", "box-b", "box-c"] {
        create::create(
            options(name, workspace.path()),
            &Default::default(),
            &paths,
            &runtime,
            &cancel,
        )
        .await
        .expect("create");
    }
    let all = SandboxMetadata::load_all(&paths).expect("load_all");
    let slots: Vec<u8> = ["box-a", "box-b", "box-c"]
        .iter()
        .map(|name| all[*name].network_slot)
        .collect();
    assert_eq!(slots, vec![1, 2, 3]);

    // Free the middle slot; the next creation reuses it.
    let middle = all["box-b"].clone();
    cleanup::cleanup(
        &middle,
        &CleanupOptions::everything(),
        Some(&runtime),
        &paths,
        &cancel,
    )
    .await;
    let result = create::create(
        options("box-d", workspace.path()),
        &Default::default(),
        &paths,
        &runtime,
        &cancel,
    )
    .await
    .expect("create");
    assert_eq!(result.metadata.network_slot, 2);
}

#[tokio::test]
async fn identity_tiers_override_field_by_field() {
    let (_state, paths, workspace) = setup();
    let runtime = FakeRuntime::new();
    let cancel = CancellationToken::new();

    // Template tier supplies a full identity; the CLI tier overrides only
    // the user. The email must survive from the lower tier.
    paths.ensure_dirs().expect("dirs");
    std::fs::write(
        paths.template_path("with-identity"),
        r#"
[agent_identity]
git_user = "Template User"
git_email = "template@example.com"
"#,
    )
    .expect("write template");

    let mut create_options = options("tiered", workspace.path());
    create_options.template = "with-identity".to_string();
    create_options.git_user = Some("Cli User".to_string());
    create_options.git_email = None;
    let result = create::create(create_options, &Default::default(), &paths, &runtime, &cancel)
        .await
        .expect("create");
    assert_eq!(result.metadata.agent_identity.git_user, "Cli User");
    assert_eq!(
        result.metadata.agent_identity.git_email,
        "template@example.com"
    );
}

#[tokio::test]
async fn mount_conflict_aborts_creation_without_metadata() {
    let (_state, paths, workspace) = setup();
    let runtime = FakeRuntime::new();
    let cancel = CancellationToken::new();

    // A template mount claiming /etc/forage.json collides with the staged
    // identity file's mount during collection.
    paths.ensure_dirs().expect("dirs");
    std::fs::write(
        paths.template_path("colliding"),
        format!(
            r#"
[[workspace_mounts]]
name = "main"
container_path = "/workspace"
host_path = "{workspace}"

[[workspace_mounts]]
name = "meta"
container_path = "/etc/forage.json"
host_path = "{workspace}"
"#,
            workspace = workspace.path().display()
        ),
    )
    .expect("write template");

    let mut create_options = options("collide", workspace.path());
    create_options.template = "colliding".to_string();
    let err = create::create(create_options, &Default::default(), &paths, &runtime, &cancel)
        .await
        .expect_err("collision");
    assert!(matches!(err, ForageErr::MountConflict { .. }), "{err}");
    assert!(!SandboxMetadata::exists(&paths, "collide"));
    assert!(!paths.config_blob_path("collide").exists());
}

#[tokio::test]
async fn container_start_failure_rolls_back_completely() {
    let (_state, paths, workspace) = setup();
    let runtime = FakeRuntime {
        fail_create: true,
        ..FakeRuntime::new()
    };
    let cancel = CancellationToken::new();

    let err = create::create(
        options("doomed", workspace.path()),
        &Default::default(),
        &paths,
        &runtime,
        &cancel,
    )
    .await
    .expect_err("create should fail");
    assert!(matches!(err, ForageErr::BackendFailure { .. }));

    // Rollback removed every artifact; a retry starts from scratch.
    assert_no_trace(&paths, "doomed");
    assert!(!SandboxMetadata::exists(&paths, "doomed"));

    let retriable = FakeRuntime::new();
    create::create(
        options("doomed", workspace.path()),
        &Default::default(),
        &paths,
        &retriable,
        &cancel,
    )
    .await
    .expect("retry succeeds");
}
