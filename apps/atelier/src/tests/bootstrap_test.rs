use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cache::WorkspaceCache;
use crate::sandbox::{
    InMemorySandbox, PreviewBootstrap, PreviewMode, Script, ServerReady, SessionStatus,
};
use crate::tests::support::{eventually, wait_for};

fn terminal() -> (
    mpsc::UnboundedSender<String>,
    mpsc::UnboundedReceiver<String>,
) {
    mpsc::unbounded_channel()
}

fn seeded_cache(files: &[(&str, &str)]) -> WorkspaceCache {
    let (cache, _notices) = WorkspaceCache::new();
    for (path, content) in files {
        cache.insert_optimistic(path, content.to_string());
    }
    cache
}

#[test_timeout::tokio_timeout_test]
async fn waits_for_the_manifest_before_doing_anything() {
    let sandbox = Arc::new(InMemorySandbox::with_default_node_scripts());
    let cache = seeded_cache(&[("src/main.tsx", "render()")]);
    let (terminal_tx, _terminal_rx) = terminal();
    let bootstrap = PreviewBootstrap::new(
        sandbox.clone(),
        cache.clone(),
        PreviewMode::Dev,
        terminal_tx,
    );

    bootstrap.evaluate().await;

    assert_eq!(*bootstrap.status().borrow(), SessionStatus::Idle);
    assert_eq!(sandbox.file("src/main.tsx"), None);

    // the manifest arriving is what unlocks the sequence
    cache.insert_optimistic("package.json", "{}".to_string());
    bootstrap.evaluate().await;
    assert_eq!(sandbox.file("package.json").as_deref(), Some("{}"));
    assert_eq!(sandbox.file("src/main.tsx").as_deref(), Some("render()"));
}

#[test_timeout::tokio_timeout_test]
async fn dev_sequence_reaches_ready_with_a_server_url() {
    let sandbox = Arc::new(InMemorySandbox::with_default_node_scripts());
    let cache = seeded_cache(&[("package.json", "{}"), ("src/main.tsx", "render()")]);
    let (terminal_tx, mut terminal_rx) = terminal();
    let bootstrap = Arc::new(PreviewBootstrap::new(
        sandbox.clone(),
        cache.clone(),
        PreviewMode::Dev,
        terminal_tx,
    ));
    let driver = bootstrap.clone().spawn_driver();

    let mut status = bootstrap.status();
    wait_for(&mut status, SessionStatus::Ready).await;

    assert_eq!(
        bootstrap.server_url().borrow().as_str(),
        "http://localhost:5173"
    );
    assert_eq!(bootstrap.setup_error(), None);

    let mut lines = Vec::new();
    while let Ok(line) = terminal_rx.try_recv() {
        lines.push(line);
    }
    assert!(lines.iter().any(|line| line.contains("mounting")));
    assert!(lines.iter().any(|line| line.contains("installing")));
    assert!(lines.iter().any(|line| line.contains("development server")));

    driver.abort();
}

#[test_timeout::tokio_timeout_test]
async fn production_mode_builds_before_serving() {
    let sandbox = Arc::new(InMemorySandbox::with_default_node_scripts());
    let cache = seeded_cache(&[("package.json", "{}")]);
    let (terminal_tx, _terminal_rx) = terminal();
    let bootstrap = Arc::new(PreviewBootstrap::new(
        sandbox.clone(),
        cache.clone(),
        PreviewMode::Production,
        terminal_tx,
    ));
    let driver = bootstrap.clone().spawn_driver();

    let mut status = bootstrap.status();
    wait_for(&mut status, SessionStatus::Ready).await;
    assert_eq!(
        bootstrap.server_url().borrow().as_str(),
        "http://localhost:3000"
    );

    driver.abort();
}

#[test_timeout::tokio_timeout_test]
async fn resumable_setup_skips_mount_and_install() {
    let sandbox = Arc::new(InMemorySandbox::with_default_node_scripts());
    // the sandbox already carries the manifest and a dependency marker
    sandbox.seed_file("package.json", "seeded");
    sandbox.seed_file("node_modules/.modules.yaml", "hoistPattern: []");
    let cache = seeded_cache(&[("package.json", "{\"name\":\"x\"}")]);
    let (terminal_tx, _terminal_rx) = terminal();
    let bootstrap = PreviewBootstrap::new(
        sandbox.clone(),
        cache.clone(),
        PreviewMode::Dev,
        terminal_tx,
    );

    bootstrap.evaluate().await;

    // mount skipped: the seeded manifest was not overwritten by the cache copy
    assert_eq!(sandbox.file("package.json").as_deref(), Some("seeded"));
    // install skipped: only the dev server was spawned
    assert_eq!(sandbox.spawned_commands(), vec!["pnpm run dev"]);
}

#[test_timeout::tokio_timeout_test]
async fn install_failure_is_fatal_but_retryable() {
    let sandbox = Arc::new(InMemorySandbox::new());
    sandbox.install_script(
        "pnpm install --prefer-offline",
        Script::fails(&["ERR_PNPM_REGISTRY unreachable"], 1),
    );
    let cache = seeded_cache(&[("package.json", "{}")]);
    let (terminal_tx, mut terminal_rx) = terminal();
    let bootstrap = PreviewBootstrap::new(
        sandbox.clone(),
        cache.clone(),
        PreviewMode::Dev,
        terminal_tx,
    );

    bootstrap.evaluate().await;

    assert_eq!(*bootstrap.status().borrow(), SessionStatus::Failed);
    let error = bootstrap.setup_error().expect("setup error recorded");
    assert!(error.contains("install"));
    let mut saw_process_output = false;
    while let Ok(line) = terminal_rx.try_recv() {
        saw_process_output |= line.contains("ERR_PNPM_REGISTRY");
    }
    assert!(saw_process_output);

    // the started flag was cleared, so fixing the environment allows a retry
    sandbox.install_script(
        "pnpm install --prefer-offline",
        Script::succeeds(&["Done"]),
    );
    bootstrap.evaluate().await;
    assert_eq!(*bootstrap.status().borrow(), SessionStatus::Starting);
    assert_eq!(bootstrap.setup_error(), None);
}

#[test_timeout::tokio_timeout_test]
async fn resync_writes_exactly_the_changed_paths() {
    let sandbox = Arc::new(InMemorySandbox::with_default_node_scripts());
    let cache = seeded_cache(&[("package.json", "{}"), ("a", "1"), ("b", "2")]);
    let (terminal_tx, _terminal_rx) = terminal();
    let bootstrap = PreviewBootstrap::new(
        sandbox.clone(),
        cache.clone(),
        PreviewMode::Dev,
        terminal_tx,
    );

    bootstrap.evaluate().await;
    assert!(sandbox.written_paths().is_empty());

    cache.record_local_edit("b", "3".into());
    cache.record_local_edit("c", "4".into());
    bootstrap.evaluate().await;

    let mut written = sandbox.written_paths();
    written.sort();
    assert_eq!(written, vec!["b", "c"]);
    assert_eq!(sandbox.file("a").as_deref(), Some("1"));
    assert_eq!(sandbox.file("b").as_deref(), Some("3"));
    assert_eq!(sandbox.file("c").as_deref(), Some("4"));

    // unchanged snapshot: nothing further to write
    bootstrap.evaluate().await;
    assert_eq!(sandbox.written_paths().len(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn ready_announcement_before_final_step_still_converges() {
    let sandbox = Arc::new(InMemorySandbox::new());
    // dev server script with no announcement of its own
    sandbox.install_script("pnpm run dev", Script {
        output: vec!["listening".into()],
        exit_code: None,
        ..Script::default()
    });
    let cache = seeded_cache(&[("package.json", "{}")]);
    let (terminal_tx, _terminal_rx) = terminal();
    let bootstrap = PreviewBootstrap::new(
        sandbox.clone(),
        cache.clone(),
        PreviewMode::Dev,
        terminal_tx,
    );

    // the runtime announces readiness before the state machine finishes
    bootstrap.handle_server_ready(ServerReady {
        port: 8080,
        url: "http://localhost:8080".into(),
    });
    assert_ne!(*bootstrap.status().borrow(), SessionStatus::Ready);

    bootstrap.evaluate().await;
    assert_eq!(*bootstrap.status().borrow(), SessionStatus::Ready);
    assert_eq!(
        bootstrap.server_url().borrow().as_str(),
        "http://localhost:8080"
    );
}

#[test_timeout::tokio_timeout_test]
async fn driver_picks_up_cache_changes_after_ready() {
    let sandbox = Arc::new(InMemorySandbox::with_default_node_scripts());
    let cache = seeded_cache(&[("package.json", "{}"), ("src/App.tsx", "v1")]);
    let (terminal_tx, _terminal_rx) = terminal();
    let bootstrap = Arc::new(PreviewBootstrap::new(
        sandbox.clone(),
        cache.clone(),
        PreviewMode::Dev,
        terminal_tx,
    ));
    let driver = bootstrap.clone().spawn_driver();
    let mut status = bootstrap.status();
    wait_for(&mut status, SessionStatus::Ready).await;

    cache.record_local_edit("src/App.tsx", "v2".into());
    let sandbox_view = sandbox.clone();
    eventually(move || sandbox_view.file("src/App.tsx").as_deref() == Some("v2")).await;

    driver.abort();
}
