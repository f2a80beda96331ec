//! Client-side mirror of the remote workspace: tree shape, fetched file
//! contents, pending requests, and the active editor selection.
//!
//! Inbound mutation flows through exactly one path, [`WorkspaceCache::apply_event`],
//! an exhaustive reducer over the tagged server events. Outbound-driven
//! mutation (opens, edits, optimistic inserts) goes through the coordinator
//! entry points. All mutation happens inside a short lock section between
//! suspension points, so readers on the control thread always observe a
//! complete state.

pub mod tree;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};

use workspace_proto::{FileNode, ServerEvent, TreePayload, normalize_path};

use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource {
    Remote,
    LocalEdit,
    Optimistic,
}

#[derive(Debug, Clone)]
pub struct FileCacheEntry {
    pub content: String,
    pub source: ContentSource,
    /// Last content value acknowledged or broadcast by the remote service.
    pub last_synced_content: Option<String>,
}

impl FileCacheEntry {
    fn remote(content: String) -> Self {
        Self {
            content: content.clone(),
            source: ContentSource::Remote,
            last_synced_content: Some(content),
        }
    }

    /// True while `content` has diverged from what the remote last saw.
    pub fn is_dirty(&self) -> bool {
        match &self.last_synced_content {
            Some(synced) => *synced != self.content,
            None => true,
        }
    }
}

/// Out-of-band conditions surfaced to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheNotice {
    Notification(String),
    RemoteError(String),
    /// A broadcast tried to overwrite an unsent local edit; the edit won.
    EditConflict { path: String },
    /// The workspace was deleted remotely; the session must end.
    Evicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionFate {
    #[default]
    Active,
    /// The workspace was deleted remotely; the session cannot continue.
    Evicted,
}

/// Follow-up work a reducer step needs the coordinator to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEffect {
    FetchFile { path: String },
}

/// Result of a user-initiated open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Content was cached; selection and display updated immediately.
    Cached,
    /// An interactive request for this path is already in flight; reuse it.
    AlreadyPending,
    /// Marked pending; the caller must issue the content request.
    Requested,
}

struct CacheState {
    tree: Vec<FileNode>,
    files: HashMap<String, FileCacheEntry>,
    active_file: Option<String>,
    displayed: String,
    pending_silent: HashSet<String>,
    pending_interactive: HashSet<String>,
    file_loading: bool,
    tree_loading: bool,
    fate: SessionFate,
}

impl Default for CacheState {
    fn default() -> Self {
        Self {
            tree: Vec::new(),
            files: HashMap::new(),
            active_file: None,
            displayed: String::new(),
            pending_silent: HashSet::new(),
            pending_interactive: HashSet::new(),
            file_loading: false,
            // the first snapshot has not arrived yet
            tree_loading: true,
            fate: SessionFate::default(),
        }
    }
}

struct CacheShared {
    state: RwLock<CacheState>,
    revision_tx: watch::Sender<u64>,
    notices_tx: mpsc::UnboundedSender<CacheNotice>,
}

/// Cheaply cloneable handle; all clones view the same state.
#[derive(Clone)]
pub struct WorkspaceCache {
    shared: Arc<CacheShared>,
}

impl WorkspaceCache {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CacheNotice>) {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (revision_tx, _) = watch::channel(0);
        let cache = Self {
            shared: Arc::new(CacheShared {
                state: RwLock::new(CacheState::default()),
                revision_tx,
                notices_tx,
            }),
        };
        (cache, notices_rx)
    }

    /// The only inbound mutation path. Events apply in arrival order.
    pub fn apply_event(&self, event: ServerEvent) -> Option<CacheEffect> {
        match event {
            ServerEvent::Tree { items } => {
                self.apply_tree_snapshot(items);
                None
            }
            ServerEvent::FileContent { path, content } => {
                self.apply_file_content(&path, content);
                None
            }
            ServerEvent::FileUpdated { path, content } => {
                match content {
                    Some(content) => self.apply_broadcast_update(&path, content),
                    // bare ack of our own update
                    None => tracing::debug!(target: "atelier::cache", path, "file update acknowledged"),
                }
                None
            }
            ServerEvent::FileCreated { path, tree } => {
                tracing::debug!(target: "atelier::cache", path, "file created");
                self.adopt_tree(tree);
                None
            }
            ServerEvent::FolderCreated { path, tree } => {
                tracing::debug!(target: "atelier::cache", path, "folder created");
                self.adopt_tree(tree);
                None
            }
            ServerEvent::FileUploaded { path, tree } => {
                tracing::debug!(target: "atelier::cache", path, "file uploaded");
                self.adopt_tree(tree);
                None
            }
            ServerEvent::FileDeleted { path, tree } => {
                self.apply_delete(&path, tree);
                None
            }
            ServerEvent::FileRenamed {
                old_path,
                new_path,
                tree,
            } => {
                self.apply_rename(&old_path, &new_path, tree);
                None
            }
            ServerEvent::Notification { message } => {
                self.notify(CacheNotice::Notification(message));
                None
            }
            ServerEvent::ComponentSelected { path } => self.select_component(&path),
            ServerEvent::WorkspaceDeleted => {
                tracing::warn!(target: "atelier::cache", "workspace deleted remotely");
                self.shared.state.write().fate = SessionFate::Evicted;
                self.notify(CacheNotice::Evicted);
                self.touch();
                None
            }
            ServerEvent::Error { error, message } => {
                let text = error
                    .or(message)
                    .unwrap_or_else(|| "unspecified server error".to_string());
                self.notify(CacheNotice::RemoteError(text));
                None
            }
            ServerEvent::Unknown => {
                tracing::debug!(target: "atelier::cache", "ignoring unknown server event");
                None
            }
        }
    }

    /// Full structural replace. Identity is decided by comparing the trees,
    /// never by item counts.
    fn apply_tree_snapshot(&self, items: Vec<FileNode>) {
        let _guard = telemetry::PerfGuard::new("cache.apply_tree");
        let inline = tree::inline_contents(&items);
        let mut state = self.shared.state.write();
        let changed = state.tree != items;
        if changed {
            for (path, content) in inline {
                let path = normalize_path(&path);
                let dirty = state
                    .files
                    .get(&path)
                    .is_some_and(|entry| entry.is_dirty());
                if !dirty {
                    state.files.insert(path, FileCacheEntry::remote(content));
                }
            }
            state.tree = items;
        }
        state.tree_loading = false;
        drop(state);
        if changed {
            self.touch();
        }
    }

    /// A silent response fills the cache without touching the selection or
    /// the interactive loading flag. An interactive response activates only
    /// while its path is still of pending interest; superseded responses are
    /// stored but do not steal the selection.
    fn apply_file_content(&self, path: &str, content: String) {
        let path = normalize_path(path);
        let mut state = self.shared.state.write();
        if state.pending_silent.remove(&path) {
            state.files.insert(path, FileCacheEntry::remote(content));
            drop(state);
            self.touch();
            return;
        }
        let was_requested = state.pending_interactive.remove(&path);
        if was_requested || state.pending_interactive.is_empty() {
            state
                .files
                .insert(path.clone(), FileCacheEntry::remote(content.clone()));
            state.active_file = Some(path);
            state.displayed = content;
            state.file_loading = !state.pending_interactive.is_empty();
        } else {
            state.files.insert(path, FileCacheEntry::remote(content));
        }
        drop(state);
        self.touch();
    }

    /// Broadcast from another actor editing the same workspace. A dirty
    /// local edit is never clobbered: the edit wins, the sync watermark
    /// advances, and the conflict is surfaced.
    fn apply_broadcast_update(&self, path: &str, content: String) {
        let path = normalize_path(path);
        let mut conflict = false;
        {
            let mut guard = self.shared.state.write();
            let state = &mut *guard;
            let is_active = state.active_file.as_deref() == Some(path.as_str());
            match state.files.get_mut(&path) {
                Some(entry) if entry.is_dirty() && digest(&entry.content) != digest(&content) => {
                    entry.last_synced_content = Some(content);
                    conflict = true;
                }
                Some(entry) => {
                    entry.content = content.clone();
                    entry.source = ContentSource::Remote;
                    entry.last_synced_content = Some(content.clone());
                    if is_active {
                        state.displayed = content;
                    }
                }
                None => {
                    state
                        .files
                        .insert(path.clone(), FileCacheEntry::remote(content.clone()));
                    if is_active {
                        state.displayed = content;
                    }
                }
            }
        }
        if conflict {
            self.notify(CacheNotice::EditConflict { path });
        }
        self.touch();
    }

    fn apply_delete(&self, path: &str, tree: Option<TreePayload>) {
        let path = normalize_path(path);
        let mut state = self.shared.state.write();
        if let Some(payload) = tree {
            state.tree = payload.items;
            state.tree_loading = false;
        }
        state.files.remove(&path);
        if state.active_file.as_deref() == Some(path.as_str()) {
            state.active_file = None;
            state.displayed.clear();
        }
        drop(state);
        self.touch();
    }

    fn apply_rename(&self, old_path: &str, new_path: &str, tree: Option<TreePayload>) {
        let old_path = normalize_path(old_path);
        let new_path = normalize_path(new_path);
        let mut state = self.shared.state.write();
        if let Some(payload) = tree {
            state.tree = payload.items;
            state.tree_loading = false;
        }
        if let Some(entry) = state.files.remove(&old_path) {
            state.files.insert(new_path.clone(), entry);
        }
        if state.active_file.as_deref() == Some(old_path.as_str()) {
            // selection follows the rename; displayed content is unchanged
            state.active_file = Some(new_path);
        }
        drop(state);
        self.touch();
    }

    fn adopt_tree(&self, tree: Option<TreePayload>) {
        if let Some(payload) = tree {
            self.apply_tree_snapshot(payload.items);
        }
    }

    fn select_component(&self, path: &str) -> Option<CacheEffect> {
        let path = normalize_path(path);
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        state.active_file = Some(path.clone());
        if let Some(entry) = state.files.get(&path) {
            state.displayed = entry.content.clone();
            drop(guard);
            self.touch();
            return None;
        }
        let effect = if state.pending_interactive.insert(path.clone()) {
            state.file_loading = true;
            Some(CacheEffect::FetchFile { path })
        } else {
            None
        };
        drop(guard);
        self.touch();
        effect
    }

    // --- coordinator entry points ---

    pub fn begin_open(&self, path: &str) -> OpenOutcome {
        let path = normalize_path(path);
        let mut state = self.shared.state.write();
        if let Some(entry) = state.files.get(&path) {
            let content = entry.content.clone();
            state.active_file = Some(path);
            state.displayed = content;
            drop(state);
            self.touch();
            return OpenOutcome::Cached;
        }
        if state.pending_interactive.contains(&path) {
            return OpenOutcome::AlreadyPending;
        }
        state.pending_interactive.insert(path);
        state.file_loading = true;
        OpenOutcome::Requested
    }

    /// Tag a path as silently pending. Returns false when the path is
    /// already awaiting a response of either kind.
    pub fn mark_silent(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let mut state = self.shared.state.write();
        if state.pending_interactive.contains(&path) || state.pending_silent.contains(&path) {
            return false;
        }
        state.pending_silent.insert(path);
        true
    }

    pub fn record_local_edit(&self, path: &str, content: String) {
        let path = normalize_path(path);
        let mut state = self.shared.state.write();
        let entry = state
            .files
            .entry(path.clone())
            .or_insert_with(|| FileCacheEntry {
                content: String::new(),
                source: ContentSource::LocalEdit,
                last_synced_content: None,
            });
        entry.content = content.clone();
        entry.source = ContentSource::LocalEdit;
        if state.active_file.as_deref() == Some(path.as_str()) {
            state.displayed = content;
        }
        drop(state);
        self.touch();
    }

    pub fn insert_optimistic(&self, path: &str, content: String) {
        let path = normalize_path(path);
        let mut state = self.shared.state.write();
        state.files.insert(
            path,
            FileCacheEntry {
                content,
                source: ContentSource::Optimistic,
                last_synced_content: None,
            },
        );
        drop(state);
        self.touch();
    }

    /// Channel reset: every in-flight request is gone with the socket.
    pub fn reset_pending(&self) {
        let mut state = self.shared.state.write();
        state.pending_silent.clear();
        state.pending_interactive.clear();
        state.file_loading = false;
    }

    pub fn set_tree_loading(&self) {
        self.shared.state.write().tree_loading = true;
    }

    // --- observers ---

    pub fn tree(&self) -> Vec<FileNode> {
        self.shared.state.read().tree.clone()
    }

    pub fn content_map(&self) -> HashMap<String, String> {
        self.shared
            .state
            .read()
            .files
            .iter()
            .map(|(path, entry)| (path.clone(), entry.content.clone()))
            .collect()
    }

    pub fn file_content(&self, path: &str) -> Option<String> {
        let path = normalize_path(path);
        self.shared
            .state
            .read()
            .files
            .get(&path)
            .map(|entry| entry.content.clone())
    }

    pub fn file_entry(&self, path: &str) -> Option<FileCacheEntry> {
        let path = normalize_path(path);
        self.shared.state.read().files.get(&path).cloned()
    }

    pub fn has_file(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.shared.state.read().files.contains_key(&path)
    }

    pub fn active_file(&self) -> Option<String> {
        self.shared.state.read().active_file.clone()
    }

    pub fn displayed_content(&self) -> String {
        self.shared.state.read().displayed.clone()
    }

    pub fn is_file_loading(&self) -> bool {
        self.shared.state.read().file_loading
    }

    pub fn is_tree_loading(&self) -> bool {
        self.shared.state.read().tree_loading
    }

    pub fn is_prefetching(&self) -> bool {
        !self.shared.state.read().pending_silent.is_empty()
    }

    pub fn fate(&self) -> SessionFate {
        self.shared.state.read().fate
    }

    /// Ticks on every content or structure mutation.
    pub fn revision(&self) -> watch::Receiver<u64> {
        self.shared.revision_tx.subscribe()
    }

    fn touch(&self) {
        self.shared.revision_tx.send_modify(|revision| *revision += 1);
    }

    fn notify(&self, notice: CacheNotice) {
        let _ = self.shared.notices_tx.send(notice);
    }
}

fn digest(text: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}
