//! Command-line shape of the flatpak, ostree and git wrappers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use repro_tooling::fakes::ScriptedRunner;
use repro_tooling::{
    checkout_bare_mirror, CommandOutput, CommandRunner, Flatpak, FlatpakRef, Git, InstallSource,
    Ostree, ToolError, FLATHUB_REPO_URL,
};

fn client(runner: &Arc<ScriptedRunner>) -> Flatpak {
    let dyn_runner: Arc<dyn CommandRunner> = runner.clone();
    Flatpak::new(dyn_runner, "/data/flatpak_root")
        .in_container(false)
        .with_timeout(Some(Duration::from_secs(60)))
}

#[tokio::test]
async fn install_from_remote_and_local_repo() {
    let runner = Arc::new(ScriptedRunner::new());
    let fp = client(&runner);

    fp.install("app/org.example.App/x86_64/stable", &InstallSource::flathub())
        .await
        .unwrap();
    fp.install(
        "app/org.example.App/x86_64/stable",
        &InstallSource::LocalRepo("/srv/repo".into()),
    )
    .await
    .unwrap();

    let calls = runner.calls_to("flatpak");
    assert_eq!(
        calls[0].args,
        vec![
            "install",
            "--user",
            "--assumeyes",
            "--noninteractive",
            "--reinstall",
            "flathub",
            "app/org.example.App/x86_64/stable"
        ]
    );
    assert_eq!(calls[1].args[5], "/srv/repo");
    for call in &calls {
        assert!(call
            .env
            .contains(&("FLATPAK_USER_DIR".to_string(), "/data/flatpak_root".to_string())));
        assert_eq!(call.timeout, Some(Duration::from_secs(60)));
    }
}

#[tokio::test]
async fn remote_probe_maps_exit_status() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.on("flatpak", &["remote-info"], CommandOutput::failed(1, "Nothing matches"));
    runner.on(
        "flatpak",
        &["remote-info", "app/org.example.App/x86_64/stable"],
        CommandOutput::ok("ID: org.example.App"),
    );
    let fp = client(&runner);

    let app = FlatpakRef::app("org.example.App", "x86_64", "stable");
    let other = FlatpakRef::app("org.example.Missing", "x86_64", "stable");
    assert!(fp.remote_has_ref("flathub", &app).await.unwrap());
    assert!(!fp.remote_has_ref("flathub", &other).await.unwrap());
}

#[tokio::test]
async fn failed_install_carries_context() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.on(
        "flatpak",
        &["install"],
        CommandOutput::failed(1, "error: No remote refs found"),
    );
    let fp = client(&runner);

    let err = fp
        .install("runtime/org.example.App.Sources/x86_64/stable", &InstallSource::flathub())
        .await
        .unwrap_err();
    match err {
        ToolError::Failed { context, detail, .. } => {
            assert!(context.contains("Failed to install or reinstall"));
            assert_eq!(detail, "error: No remote refs found");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn pin_and_mask_commands() {
    let runner = Arc::new(ScriptedRunner::new());
    let fp = client(&runner);

    fp.add_remote("flathub", FLATHUB_REPO_URL).await.unwrap();
    fp.update_to_commit("org.freedesktop.Platform//25.08", "abc123").await.unwrap();
    fp.mask("org.freedesktop.Platform//25.08", false).await.unwrap();
    fp.mask("org.freedesktop.Platform//25.08", true).await.unwrap();

    let calls = runner.calls_to("flatpak");
    assert_eq!(
        calls[0].args,
        vec!["remote-add", "--user", "--if-not-exists", "flathub", FLATHUB_REPO_URL]
    );
    assert!(calls[1].has_arg("--commit=abc123"));
    assert!(calls[1].has_arg("--no-deps"));
    assert_eq!(calls[2].args, vec!["mask", "--user", "org.freedesktop.Platform//25.08"]);
    assert_eq!(
        calls[3].args,
        vec!["mask", "--user", "--remove", "org.freedesktop.Platform//25.08"]
    );
}

#[tokio::test]
async fn ostree_refs_are_split_per_line() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.on(
        "ostree",
        &["refs"],
        CommandOutput::ok("app/org.example.App/x86_64/repro\nruntime/org.example.App.Debug/x86_64/repro\n"),
    );
    let dyn_runner: Arc<dyn CommandRunner> = runner.clone();
    let refs = Ostree::new(dyn_runner).refs(Path::new("/build/repo")).await.unwrap();

    assert_eq!(refs.len(), 2);
    assert_eq!(repro_tooling::find_app_branch(&refs).as_deref(), Some("repro"));
    assert!(runner.was_called_with("ostree", &["--repo=/build/repo", "refs"]));
}

#[tokio::test]
async fn bare_mirror_is_cloned_then_checked_out() {
    let dir = tempfile::tempdir().unwrap();
    let bare = dir.path().join("https_example.com_example_app.git");
    std::fs::create_dir(&bare).unwrap();

    let runner = Arc::new(ScriptedRunner::new());
    let dyn_runner: Arc<dyn CommandRunner> = runner.clone();
    let git = Git::new(dyn_runner);

    let checkout = checkout_bare_mirror(&git, &bare, dir.path(), "xyz789").await.unwrap();
    assert_eq!(
        checkout,
        dir.path().join("https_example.com_example_app.git_checkout")
    );

    let calls = runner.calls_to("git");
    assert_eq!(calls.len(), 2);
    assert!(calls[0].has_arg("clone"));
    assert!(calls[0].has_arg("credential.interactive=false"));
    assert_eq!(calls[1].args[calls[1].args.len() - 3..], ["checkout", "-f", "xyz789"]);
}
