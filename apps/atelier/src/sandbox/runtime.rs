//! Boundary to the sandboxed execution runtime. The engine drives a runtime
//! through this trait; it never implements execution itself. Real runtimes
//! live outside this crate; [`super::in_memory::InMemorySandbox`] stands in
//! for tests and the CLI preview.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use super::mount_tree::MountTree;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox path not found: {0}")]
    NotFound(String),
    #[error("sandbox filesystem error: {0}")]
    Filesystem(String),
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("{step} exited with code {code}")]
    StepFailed { step: &'static str, code: i32 },
}

/// Announcement that the embedded server is accepting connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

/// A spawned process: combined stdout/stderr chunks plus an exit code.
/// Long-running server processes never resolve `exit`; their output streams
/// until the process (or the runtime) goes away.
pub struct SandboxProcess {
    pub output: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<i32>,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Write a whole nested tree into the sandbox filesystem in one call.
    /// Mounting adds and overwrites; it does not remove existing entries.
    async fn mount(&self, tree: &MountTree) -> Result<(), SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), SandboxError>;

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError>;

    async fn spawn(&self, program: &str, args: &[&str]) -> Result<SandboxProcess, SandboxError>;

    /// Watch for server-ready announcements. Starts at `None`.
    fn server_ready(&self) -> watch::Receiver<Option<ServerReady>>;
}
