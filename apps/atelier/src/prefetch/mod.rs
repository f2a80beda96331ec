//! Cache warming. Once the channel is up and a tree snapshot exists, the
//! scheduler silently requests every file the preview sandbox will need, so
//! the first boot does not stall on round-trips. Requests are staggered to
//! keep the burst off the channel; a file that never arrives simply stays
//! absent and the bootstrap treats it as not yet available.

use std::collections::HashSet;
use std::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};

use workspace_proto::{ClientCommand, FileNode};

use crate::cache::{WorkspaceCache, tree};
use crate::channel::CommandSink;

/// Tooling files matched anywhere in the tree by suffix.
pub const CONFIG_FILES: &[&str] = &[
    "package.json",
    "vite.config.ts",
    "tsconfig.json",
    "tsconfig.app.json",
    "tsconfig.node.json",
    "index.html",
    "postcss.config.js",
    "tailwind.config.js",
];

const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "css"];
const MAIN_ENTRY_SUFFIXES: &[&str] = &["main.tsx", "index.tsx"];
const APP_ENTRY_SUFFIX: &str = "App.tsx";
const STYLE_ENTRY_SUFFIX: &str = "index.css";

/// Deterministic candidate list: tooling configs, then the first entry file
/// of each class in depth-first tree order, then every source/style file.
/// Each path appears once, at its first position.
pub fn plan(nodes: &[FileNode]) -> Vec<String> {
    fn add(path: &str, candidates: &mut Vec<String>, seen: &mut HashSet<String>) {
        if seen.insert(path.to_string()) {
            candidates.push(path.to_string());
        }
    }

    let all_paths = tree::file_paths(nodes);
    let mut candidates = Vec::new();
    let mut seen = HashSet::new();

    for config in CONFIG_FILES {
        let found = all_paths
            .iter()
            .find(|p| p.as_str() == *config || p.ends_with(&format!("/{config}")));
        if let Some(path) = found {
            add(path, &mut candidates, &mut seen);
        }
    }

    let main_entry = all_paths
        .iter()
        .find(|p| MAIN_ENTRY_SUFFIXES.iter().any(|suffix| p.ends_with(*suffix)));
    if let Some(path) = main_entry {
        add(path, &mut candidates, &mut seen);
    }
    if let Some(path) = all_paths.iter().find(|p| p.ends_with(APP_ENTRY_SUFFIX)) {
        add(path, &mut candidates, &mut seen);
    }
    if let Some(path) = all_paths.iter().find(|p| p.ends_with(STYLE_ENTRY_SUFFIX)) {
        add(path, &mut candidates, &mut seen);
    }

    for path in &all_paths {
        let extension = path.rsplit('.').next().unwrap_or_default();
        if SOURCE_EXTENSIONS.contains(&extension) {
            add(path, &mut candidates, &mut seen);
        }
    }

    candidates
}

pub struct PrefetchScheduler {
    stagger: Duration,
    fired: AtomicBool,
}

impl PrefetchScheduler {
    pub fn new(stagger: Duration) -> Self {
        Self {
            stagger,
            fired: AtomicBool::new(false),
        }
    }

    /// Issue one silent `open_file` per candidate. Runs at most once per
    /// scheduler lifetime; later tree updates do not re-trigger it.
    pub async fn run(&self, cache: &WorkspaceCache, sink: &dyn CommandSink) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let candidates = plan(&cache.tree());
        tracing::info!(
            target: "atelier::prefetch",
            count = candidates.len(),
            "warming workspace cache"
        );
        let mut sent = 0usize;
        for path in candidates {
            if sent > 0 {
                tokio::time::sleep(self.stagger).await;
            }
            if !cache.mark_silent(&path) {
                continue;
            }
            let delivered = sink.send_command(&ClientCommand::OpenFile {
                path: path.clone(),
                silent: true,
            });
            if !delivered {
                tracing::debug!(target: "atelier::prefetch", path, "prefetch request not sent");
            }
            sent += 1;
        }
    }
}
