pub mod session;

pub use session::{SessionStreams, WorkspaceSession};
