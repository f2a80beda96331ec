use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::OpenOutcome;
use crate::config::Config;
use crate::sandbox::{InMemorySandbox, PreviewMode, SessionStatus};
use crate::tests::support::{content_for, eventually, spawn_fake_service, wait_for};
use crate::workspace::WorkspaceSession;

fn config_for(addr: std::net::SocketAddr) -> Config {
    Config {
        workspace_server: format!("http://{addr}"),
        prefetch_stagger: Duration::from_millis(1),
        heartbeat_interval: Duration::from_secs(30),
    }
}

#[test_timeout::tokio_timeout_test]
async fn connect_prefetch_and_open_from_cache() -> Result<()> {
    let (service, addr) = spawn_fake_service().await;
    let runtime = Arc::new(InMemorySandbox::with_default_node_scripts());
    let (session, _streams) =
        WorkspaceSession::spawn(&config_for(addr), "w1", runtime, PreviewMode::Dev)?;

    // the tree greeting triggers one silent prefetch per project file
    let cache = session.cache().clone();
    eventually(move || {
        cache.has_file("package.json")
            && cache.has_file("src/main.tsx")
            && cache.has_file("src/App.tsx")
    })
    .await;

    // prefetch never touched the selection
    assert_eq!(session.cache().active_file(), None);
    assert!(!session.cache().is_file_loading());
    {
        let requests = service.open_requests.lock();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|(_, silent)| *silent));
    }

    // opening a warmed file shows it instantly, with no extra request
    let outcome = session.set_active_file("src/App.tsx");
    assert_eq!(outcome, OpenOutcome::Cached);
    assert_eq!(
        session.cache().displayed_content(),
        content_for("src/App.tsx")
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.open_count(), 3);
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn preview_boots_from_the_warmed_cache() -> Result<()> {
    let (_service, addr) = spawn_fake_service().await;
    let runtime = Arc::new(InMemorySandbox::with_default_node_scripts());
    let (session, _streams) = WorkspaceSession::spawn(
        &config_for(addr),
        "w1",
        runtime.clone(),
        PreviewMode::Dev,
    )?;

    let mut preview = session.preview_status();
    wait_for(&mut preview, SessionStatus::Ready).await;
    assert_eq!(
        session.server_url().borrow().as_str(),
        "http://localhost:5173"
    );

    // the mounted filesystem converges on the prefetched cache; late
    // arrivals land through re-sync rather than a remount
    let runtime_view = runtime.clone();
    eventually(move || runtime_view.file("src/App.tsx") == Some(content_for("src/App.tsx"))).await;
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn edits_reach_the_sandbox_through_resync() -> Result<()> {
    let (_service, addr) = spawn_fake_service().await;
    let runtime = Arc::new(InMemorySandbox::with_default_node_scripts());
    let (session, _streams) = WorkspaceSession::spawn(
        &config_for(addr),
        "w1",
        runtime.clone(),
        PreviewMode::Dev,
    )?;

    let mut preview = session.preview_status();
    wait_for(&mut preview, SessionStatus::Ready).await;

    let cache = session.cache().clone();
    eventually(move || cache.has_file("src/App.tsx")).await;
    session.set_active_file("src/App.tsx");
    session.edit_active_file("export const App = () => null");

    let runtime_view = runtime.clone();
    eventually(move || {
        runtime_view.file("src/App.tsx").as_deref() == Some("export const App = () => null")
    })
    .await;
    Ok(())
}

#[test_timeout::tokio_timeout_test]
async fn session_teardown_stops_background_work() -> Result<()> {
    let (_service, addr) = spawn_fake_service().await;
    let runtime = Arc::new(InMemorySandbox::with_default_node_scripts());
    let (session, _streams) = WorkspaceSession::spawn(
        &config_for(addr),
        "w1",
        runtime.clone(),
        PreviewMode::Dev,
    )?;

    let mut preview = session.preview_status();
    wait_for(&mut preview, SessionStatus::Ready).await;
    let cache = session.cache().clone();
    drop(session);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // edits after teardown no longer reach the sandbox
    let writes_before = runtime.written_paths().len();
    cache.record_local_edit("src/App.tsx", "after teardown".into());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runtime.written_paths().len(), writes_before);
    Ok(())
}
