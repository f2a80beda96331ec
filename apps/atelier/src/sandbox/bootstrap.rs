//! Drives one sandbox runtime through mount → install → (build) → start,
//! then keeps its filesystem in sync with the workspace cache.
//!
//! Status lives in a single variable and changes only through
//! [`PreviewBootstrap::transition`]; the runtime's server-ready announcement
//! is one more input to that function, not a parallel source of truth, so
//! "final step reached" and "server ready" may arrive in either order and
//! still converge on `Ready`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::cache::{SessionFate, WorkspaceCache};
use crate::telemetry;

use super::mount_tree::build_mount_tree;
use super::runtime::{SandboxError, SandboxProcess, SandboxRuntime};
use super::runtime::ServerReady;

/// The package descriptor that gates the whole sequence: no manifest in the
/// cache means "wait", never "fail".
pub const MANIFEST_PATH: &str = "package.json";

const DEPENDENCY_DIR: &str = "node_modules";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewMode {
    Dev,
    /// Build a production bundle and serve it statically.
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Mounting,
    Installing,
    Building,
    Starting,
    Ready,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Mounting => "mounting",
            SessionStatus::Installing => "installing",
            SessionStatus::Building => "building",
            SessionStatus::Starting => "starting",
            SessionStatus::Ready => "ready",
            SessionStatus::Failed => "failed",
        }
    }
}

/// Combined process output and progress markers, line-oriented.
pub type TerminalSink = mpsc::UnboundedSender<String>;

struct BootstrapState {
    /// Set before the first suspend point of a setup run; cleared only on
    /// failure so a later cache change can retry.
    setup_started: bool,
    setup_complete: bool,
    /// Content last known to be written into the sandbox filesystem.
    last_mounted: HashMap<String, String>,
    setup_error: Option<String>,
    /// All steps ran; `Ready` still needs the server announcement.
    steps_done: bool,
    pending_ready: Option<ServerReady>,
}

pub struct PreviewBootstrap {
    runtime: Arc<dyn SandboxRuntime>,
    cache: WorkspaceCache,
    mode: PreviewMode,
    terminal: TerminalSink,
    state: Mutex<BootstrapState>,
    status_tx: watch::Sender<SessionStatus>,
    status_rx: watch::Receiver<SessionStatus>,
    url_tx: watch::Sender<String>,
    url_rx: watch::Receiver<String>,
}

impl PreviewBootstrap {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        cache: WorkspaceCache,
        mode: PreviewMode,
        terminal: TerminalSink,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);
        let (url_tx, url_rx) = watch::channel(String::new());
        Self {
            runtime,
            cache,
            mode,
            terminal,
            state: Mutex::new(BootstrapState {
                setup_started: false,
                setup_complete: false,
                last_mounted: HashMap::new(),
                setup_error: None,
                steps_done: false,
                pending_ready: None,
            }),
            status_tx,
            status_rx,
            url_tx,
            url_rx,
        }
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Empty until the status reaches `Ready`.
    pub fn server_url(&self) -> watch::Receiver<String> {
        self.url_rx.clone()
    }

    pub fn setup_error(&self) -> Option<String> {
        self.state.lock().setup_error.clone()
    }

    /// Run the driver loop: re-evaluate on every cache revision and feed
    /// server-ready announcements into the transition function. Evaluation is
    /// serialized by this single task.
    pub fn spawn_driver(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self;
        tokio::spawn(async move {
            let mut revision = this.cache.revision();
            let mut ready = this.runtime.server_ready();
            // the cache may already hold everything needed
            this.evaluate().await;
            loop {
                tokio::select! {
                    changed = revision.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        this.evaluate().await;
                    }
                    announced = ready.changed() => {
                        if announced.is_err() {
                            break;
                        }
                        let announcement = ready.borrow_and_update().clone();
                        if let Some(value) = announcement {
                            this.handle_server_ready(value);
                        }
                    }
                }
            }
        })
    }

    /// One evaluation pass. Before setup: start it once the manifest shows
    /// up in the cache. After setup: sync whatever changed since the last
    /// mounted snapshot.
    pub async fn evaluate(&self) {
        if self.cache.fate() == SessionFate::Evicted {
            return;
        }
        let snapshot = self.cache.content_map();
        let resync;
        let proceed;
        {
            let mut state = self.state.lock();
            resync = state.setup_complete;
            proceed = !resync && !state.setup_started && snapshot.contains_key(MANIFEST_PATH);
            if proceed {
                state.setup_started = true;
            }
        }
        if resync {
            self.resync(snapshot).await;
            return;
        }
        if !proceed {
            return;
        }

        match self.run_setup(&snapshot).await {
            Ok(()) => {
                let ready_pending = {
                    let mut state = self.state.lock();
                    state.setup_complete = true;
                    state.steps_done = true;
                    state.setup_error = None;
                    state.last_mounted = snapshot;
                    state.pending_ready.is_some()
                };
                if ready_pending {
                    self.transition(SessionStatus::Ready);
                }
            }
            Err(err) => {
                tracing::error!(target: "atelier::sandbox", error = %err, "preview setup failed");
                self.terminal_line(format!("error: {err}"));
                {
                    let mut state = self.state.lock();
                    state.setup_error = Some(err.to_string());
                    state.setup_started = false;
                }
                self.transition(SessionStatus::Failed);
            }
        }
    }

    /// External readiness trigger from the runtime.
    pub fn handle_server_ready(&self, ready: ServerReady) {
        tracing::info!(
            target: "atelier::sandbox",
            url = ready.url,
            port = ready.port,
            "server ready announcement"
        );
        let steps_done = {
            let mut state = self.state.lock();
            state.pending_ready = Some(ready);
            state.steps_done
        };
        if steps_done {
            self.transition(SessionStatus::Ready);
        }
    }

    async fn run_setup(&self, snapshot: &HashMap<String, String>) -> Result<(), SandboxError> {
        let already_mounted = self.runtime.read_file(MANIFEST_PATH).await.is_ok();
        if already_mounted {
            self.terminal_line("project files already mounted, skipping mount");
        } else {
            self.transition(SessionStatus::Mounting);
            self.terminal_line("mounting project files...");
            let tree = build_mount_tree(snapshot);
            self.runtime.mount(&tree).await?;
            self.terminal_line(format!("mounted {} files", snapshot.len()));
        }

        self.transition(SessionStatus::Installing);
        let installed = self
            .runtime
            .read_dir(".")
            .await
            .map(|entries| {
                entries
                    .iter()
                    .any(|entry| entry.name == DEPENDENCY_DIR && entry.is_directory)
            })
            .unwrap_or(false);
        if installed {
            self.terminal_line("dependencies already present, skipping install");
        } else {
            self.terminal_line("installing dependencies with pnpm...");
            let process = self
                .runtime
                .spawn("pnpm", &["install", "--prefer-offline"])
                .await?;
            let code = self.stream_to_exit(process).await;
            if code != 0 {
                return Err(SandboxError::StepFailed {
                    step: "install",
                    code,
                });
            }
            self.terminal_line("dependencies installed");
        }

        match self.mode {
            PreviewMode::Production => {
                self.transition(SessionStatus::Building);
                self.terminal_line("building production bundle...");
                let process = self.runtime.spawn("pnpm", &["run", "build"]).await?;
                let code = self.stream_to_exit(process).await;
                if code != 0 {
                    return Err(SandboxError::StepFailed {
                        step: "build",
                        code,
                    });
                }
                self.transition(SessionStatus::Starting);
                self.terminal_line("serving production build...");
                let process = self.runtime.spawn("pnpm", &["dlx", "serve", "dist"]).await?;
                self.stream_detached(process);
            }
            PreviewMode::Dev => {
                self.transition(SessionStatus::Starting);
                self.terminal_line("starting development server...");
                let process = self.runtime.spawn("pnpm", &["run", "dev"]).await?;
                self.stream_detached(process);
            }
        }
        Ok(())
    }

    /// Write every path whose content differs from the last mounted snapshot
    /// (including additions). The snapshot is replaced only after the whole
    /// batch has resolved; individual write failures are logged, not fatal.
    async fn resync(&self, snapshot: HashMap<String, String>) {
        let _guard = telemetry::PerfGuard::new("sandbox.resync");
        let last = self.state.lock().last_mounted.clone();
        let changed: Vec<(String, String)> = snapshot
            .iter()
            .filter(|&(path, content)| last.get(path) != Some(content))
            .map(|(path, content)| (path.clone(), content.clone()))
            .collect();
        if changed.is_empty() {
            return;
        }
        tracing::debug!(
            target: "atelier::sandbox",
            count = changed.len(),
            "syncing changed files into sandbox"
        );
        for (path, content) in &changed {
            if let Err(err) = self.runtime.write_file(path, content).await {
                tracing::warn!(target: "atelier::sandbox", path, error = %err, "sandbox write failed");
                self.terminal_line(format!("failed to write {path}: {err}"));
            }
        }
        self.state.lock().last_mounted = snapshot;
    }

    /// The only place status changes. Entering `Ready` also publishes the
    /// announced URL; every other state keeps it empty.
    fn transition(&self, to: SessionStatus) {
        tracing::debug!(target: "atelier::sandbox", status = to.as_str(), "preview status");
        if to == SessionStatus::Ready {
            let url = self
                .state
                .lock()
                .pending_ready
                .as_ref()
                .map(|ready| ready.url.clone())
                .unwrap_or_default();
            self.url_tx.send_replace(url);
        }
        self.status_tx.send_replace(to);
    }

    async fn stream_to_exit(&self, mut process: SandboxProcess) -> i32 {
        while let Some(chunk) = process.output.recv().await {
            self.terminal_line(chunk);
        }
        process.exit.await.unwrap_or(-1)
    }

    /// Long-running server processes stream forever and are never awaited.
    fn stream_detached(&self, mut process: SandboxProcess) {
        let terminal = self.terminal.clone();
        tokio::spawn(async move {
            while let Some(chunk) = process.output.recv().await {
                let _ = terminal.send(chunk);
            }
        });
    }

    fn terminal_line(&self, line: impl Into<String>) {
        let _ = self.terminal.send(line.into());
    }
}
