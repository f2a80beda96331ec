//! Wire protocol for the workspace service.
//! Keeping this in a dedicated crate allows regeneration of bindings
//! for TypeScript/Go/etc. without pulling in the engine runtime.

use serde::{Deserialize, Serialize};

/// Strip leading slashes so `/src/main.tsx` and `src/main.tsx` share one
/// cache key. Every lookup and every outbound path goes through this.
pub fn normalize_path(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    /// Older service builds emit `folder` for directories.
    #[serde(alias = "folder")]
    Directory,
}

/// One entry in the remote-mirrored file tree. `path` is slash-separated,
/// root-relative, with no leading slash, and uniquely identifies the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl FileNode {
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreePayload {
    pub items: Vec<FileNode>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Client to service commands, discriminated by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    OpenFile {
        path: String,
        #[serde(default, skip_serializing_if = "is_false")]
        silent: bool,
    },
    UpdateFile {
        path: String,
        content: String,
    },
    CreateFile {
        path: String,
        #[serde(default)]
        content: String,
    },
    DeleteFile {
        path: String,
    },
    CreateFolder {
        path: String,
    },
    RenameFile {
        old_path: String,
        new_path: String,
    },
    RecloneProject,
    GithubClone {
        repo_url: String,
    },
    GithubPush {
        message: String,
    },
    InstallProject,
    UploadFile {
        path: String,
        content: String,
    },
    GetTree,
}

/// Service to client events, discriminated by `action`. Actions this client
/// does not know about deserialize to [`ServerEvent::Unknown`] and are
/// dropped by the consumer; new server actions must fail closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerEvent {
    Tree {
        items: Vec<FileNode>,
    },
    FileContent {
        path: String,
        content: String,
    },
    FileUpdated {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    FileCreated {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tree: Option<TreePayload>,
    },
    FileDeleted {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tree: Option<TreePayload>,
    },
    FileRenamed {
        old_path: String,
        new_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tree: Option<TreePayload>,
    },
    FolderCreated {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tree: Option<TreePayload>,
    },
    FileUploaded {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tree: Option<TreePayload>,
    },
    Notification {
        message: String,
    },
    ComponentSelected {
        path: String,
    },
    WorkspaceDeleted,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Human-readable text of an `error` event, whichever field carried it.
    pub fn error_text(&self) -> Option<&str> {
        match self {
            ServerEvent::Error { error, message } => {
                error.as_deref().or(message.as_deref())
            }
            _ => None,
        }
    }
}
