pub mod bootstrap;
pub mod in_memory;
pub mod mount_tree;
pub mod runtime;

pub use bootstrap::{MANIFEST_PATH, PreviewBootstrap, PreviewMode, SessionStatus, TerminalSink};
pub use in_memory::{InMemorySandbox, Script};
pub use mount_tree::{MountEntry, MountTree, build_mount_tree};
pub use runtime::{DirEntry, SandboxError, SandboxProcess, SandboxRuntime, ServerReady};
