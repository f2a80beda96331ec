//! Session assembly and the edit coordinator.
//!
//! One [`WorkspaceSession`] per workspace view: it owns the channel, the
//! cache, the prefetch trigger, and the bootstrap driver, and it mediates the
//! three-way consistency between the editor buffer, the cache, and the
//! remote service for the active file. Edits are optimistic: the cache is
//! updated first so the sandbox re-sync picks the change up on its own
//! schedule, then the update goes out without waiting for acknowledgment.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use workspace_proto::{ClientCommand, normalize_path};

use crate::cache::{CacheEffect, CacheNotice, OpenOutcome, SessionFate, WorkspaceCache};
use crate::channel::{
    ChannelEvent, ChannelStatus, ChannelTuning, CommandSink, WorkspaceChannel,
};
use crate::config::{Config, ConfigError};
use crate::prefetch::PrefetchScheduler;
use crate::sandbox::{PreviewBootstrap, PreviewMode, SandboxRuntime, SessionStatus};

/// Streams handed to the embedding layer exactly once, at spawn.
pub struct SessionStreams {
    /// Sandbox process output and progress markers.
    pub terminal: mpsc::UnboundedReceiver<String>,
    /// Notifications, remote errors, conflicts, eviction.
    pub notices: mpsc::UnboundedReceiver<CacheNotice>,
}

pub struct WorkspaceSession {
    session_id: Uuid,
    workspace_id: String,
    channel: Arc<WorkspaceChannel>,
    cache: WorkspaceCache,
    bootstrap: Arc<PreviewBootstrap>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkspaceSession {
    /// Wire everything together and connect. The sandbox runtime handle is
    /// owned by the session's bootstrap component for the session's lifetime.
    pub fn spawn(
        config: &Config,
        workspace_id: &str,
        runtime: Arc<dyn SandboxRuntime>,
        mode: PreviewMode,
    ) -> Result<(Self, SessionStreams), ConfigError> {
        let endpoint = config.workspace_endpoint(workspace_id)?;
        let session_id = Uuid::new_v4();
        tracing::info!(
            target: "atelier::workspace",
            %session_id,
            workspace_id,
            endpoint = %endpoint,
            "starting workspace session"
        );

        let (cache, notices) = WorkspaceCache::new();
        let tuning = ChannelTuning {
            heartbeat: config.heartbeat_interval,
            ..ChannelTuning::default()
        };
        let (channel, events) = WorkspaceChannel::new(endpoint, tuning);
        let channel = Arc::new(channel);

        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        let bootstrap = Arc::new(PreviewBootstrap::new(
            runtime,
            cache.clone(),
            mode,
            terminal_tx,
        ));

        let tasks = vec![
            spawn_reducer(events, cache.clone(), channel.clone()),
            spawn_prefetch(config.prefetch_stagger, cache.clone(), channel.clone()),
            bootstrap.clone().spawn_driver(),
        ];
        channel.connect();

        let session = Self {
            session_id,
            workspace_id: workspace_id.to_string(),
            channel,
            cache,
            bootstrap,
            tasks,
        };
        let streams = SessionStreams {
            terminal: terminal_rx,
            notices,
        };
        Ok((session, streams))
    }

    // --- edit coordination ---

    /// Show a file in the editor. Cached content displays immediately; a
    /// pending interactive request for the same path is reused rather than
    /// duplicated; otherwise a non-silent content request goes out.
    pub fn set_active_file(&self, path: &str) -> OpenOutcome {
        let outcome = self.cache.begin_open(path);
        if outcome == OpenOutcome::Requested {
            let path = normalize_path(path);
            self.channel.send_command(&ClientCommand::OpenFile {
                path,
                silent: false,
            });
        }
        outcome
    }

    /// Keystroke-level change to the active file, already debounced by the
    /// editor widget. Cache first, then the wire; last write wins.
    pub fn edit_active_file(&self, content: &str) {
        let Some(path) = self.cache.active_file() else {
            tracing::debug!(target: "atelier::workspace", "edit with no active file");
            return;
        };
        self.cache.record_local_edit(&path, content.to_string());
        self.channel.send_command(&ClientCommand::UpdateFile {
            path,
            content: content.to_string(),
        });
    }

    /// Synthetic create-and-edit for imported content.
    pub fn import_file(&self, name: &str, content: &str) {
        let path = normalize_path(name);
        self.cache.insert_optimistic(&path, content.to_string());
        self.channel.send_command(&ClientCommand::UpdateFile {
            path,
            content: content.to_string(),
        });
    }

    // --- tree operations ---

    pub fn create_file(&self, path: &str, content: &str) -> bool {
        self.channel.send_command(&ClientCommand::CreateFile {
            path: normalize_path(path),
            content: content.to_string(),
        })
    }

    pub fn create_folder(&self, path: &str) -> bool {
        self.channel.send_command(&ClientCommand::CreateFolder {
            path: normalize_path(path),
        })
    }

    pub fn delete_file(&self, path: &str) -> bool {
        self.channel.send_command(&ClientCommand::DeleteFile {
            path: normalize_path(path),
        })
    }

    pub fn rename_file(&self, old_path: &str, new_path: &str) -> bool {
        self.channel.send_command(&ClientCommand::RenameFile {
            old_path: normalize_path(old_path),
            new_path: normalize_path(new_path),
        })
    }

    pub fn upload_file(&self, path: &str, content: &str) -> bool {
        self.channel.send_command(&ClientCommand::UploadFile {
            path: normalize_path(path),
            content: content.to_string(),
        })
    }

    pub fn refresh_tree(&self) -> bool {
        self.cache.set_tree_loading();
        self.channel.send_command(&ClientCommand::GetTree)
    }

    // --- repository operations ---

    pub fn reclone_project(&self) -> bool {
        self.channel.send_command(&ClientCommand::RecloneProject)
    }

    pub fn github_clone(&self, repo_url: &str) -> bool {
        self.channel.send_command(&ClientCommand::GithubClone {
            repo_url: repo_url.to_string(),
        })
    }

    pub fn github_push(&self, message: &str) -> bool {
        self.channel.send_command(&ClientCommand::GithubPush {
            message: message.to_string(),
        })
    }

    pub fn install_project(&self) -> bool {
        self.channel.send_command(&ClientCommand::InstallProject)
    }

    // --- connection control ---

    pub fn reconnect(&self) {
        self.channel.reconnect();
    }

    // --- observers ---

    pub fn cache(&self) -> &WorkspaceCache {
        &self.cache
    }

    pub fn connection_status(&self) -> watch::Receiver<ChannelStatus> {
        self.channel.status()
    }

    pub fn preview_status(&self) -> watch::Receiver<SessionStatus> {
        self.bootstrap.status()
    }

    pub fn server_url(&self) -> watch::Receiver<String> {
        self.bootstrap.server_url()
    }

    pub fn setup_error(&self) -> Option<String> {
        self.bootstrap.setup_error()
    }

    pub fn fate(&self) -> SessionFate {
        self.cache.fate()
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for WorkspaceSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        tracing::debug!(
            target: "atelier::workspace",
            session_id = %self.session_id,
            "workspace session torn down"
        );
    }
}

/// Apply inbound events in arrival order; a reducer effect turns into an
/// interactive content request.
fn spawn_reducer(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    cache: WorkspaceCache,
    channel: Arc<WorkspaceChannel>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Inbound(event) => {
                    if let Some(CacheEffect::FetchFile { path }) = cache.apply_event(event) {
                        channel.send_command(&ClientCommand::OpenFile {
                            path,
                            silent: false,
                        });
                    }
                }
                ChannelEvent::Reset => cache.reset_pending(),
            }
        }
    })
}

/// Fire the prefetch pass once the channel is connected and a tree exists.
fn spawn_prefetch(
    stagger: Duration,
    cache: WorkspaceCache,
    channel: Arc<WorkspaceChannel>,
) -> JoinHandle<()> {
    let mut status = channel.status();
    tokio::spawn(async move {
        while *status.borrow() != ChannelStatus::Connected {
            if status.changed().await.is_err() {
                return;
            }
        }
        let mut revision = cache.revision();
        while cache.tree().is_empty() {
            if revision.changed().await.is_err() {
                return;
            }
        }
        let scheduler = PrefetchScheduler::new(stagger);
        scheduler.run(&cache, channel.as_ref()).await;
    })
}
