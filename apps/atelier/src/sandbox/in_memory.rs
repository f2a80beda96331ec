//! Scriptable in-memory sandbox runtime. Backs the engine's tests and the
//! CLI preview, where a real execution sandbox is not available: the
//! filesystem is a flattened map and spawned commands replay canned output.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};

use super::mount_tree::{self, MountTree};
use super::runtime::{DirEntry, SandboxError, SandboxProcess, SandboxRuntime, ServerReady};

/// Canned behavior for one command line.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Chunks streamed as combined stdout/stderr.
    pub output: Vec<String>,
    /// `None` models a long-running server process that never exits.
    pub exit_code: Option<i32>,
    /// Files the command leaves behind, applied before output streams.
    pub creates: Vec<(String, String)>,
    /// Announced through the server-ready watch once the output drains.
    pub announce: Option<ServerReady>,
}

impl Script {
    pub fn succeeds(output: &[&str]) -> Self {
        Self {
            output: output.iter().map(|s| s.to_string()).collect(),
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn fails(output: &[&str], code: i32) -> Self {
        Self {
            output: output.iter().map(|s| s.to_string()).collect(),
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn serves(output: &[&str], ready: ServerReady) -> Self {
        Self {
            output: output.iter().map(|s| s.to_string()).collect(),
            exit_code: None,
            announce: Some(ready),
            ..Self::default()
        }
    }
}

pub struct InMemorySandbox {
    files: RwLock<BTreeMap<String, String>>,
    scripts: RwLock<HashMap<String, Script>>,
    ready_tx: watch::Sender<Option<ServerReady>>,
    ready_rx: watch::Receiver<Option<ServerReady>>,
    /// Exit senders of long-running processes, held so `exit` never resolves.
    held_exits: Mutex<Vec<oneshot::Sender<i32>>>,
    written: Mutex<Vec<String>>,
    spawned: Mutex<Vec<String>>,
}

impl InMemorySandbox {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = watch::channel(None);
        Self {
            files: RwLock::new(BTreeMap::new()),
            scripts: RwLock::new(HashMap::new()),
            ready_tx,
            ready_rx,
            held_exits: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Scripts for the standard pnpm sequence, with both server variants
    /// announcing a local preview URL.
    pub fn with_default_node_scripts() -> Self {
        let sandbox = Self::new();
        sandbox.install_script(
            "pnpm install --prefer-offline",
            Script {
                creates: vec![("node_modules/.modules.yaml".into(), "hoistPattern: []".into())],
                ..Script::succeeds(&["Lockfile is up to date", "Done in 1.4s"])
            },
        );
        sandbox.install_script(
            "pnpm run dev",
            Script::serves(
                &["VITE ready in 320 ms"],
                ServerReady {
                    port: 5173,
                    url: "http://localhost:5173".into(),
                },
            ),
        );
        sandbox.install_script(
            "pnpm run build",
            Script::succeeds(&["vite build", "built in 0.8s"]),
        );
        sandbox.install_script(
            "pnpm dlx serve dist",
            Script::serves(
                &["Accepting connections"],
                ServerReady {
                    port: 3000,
                    url: "http://localhost:3000".into(),
                },
            ),
        );
        sandbox
    }

    pub fn install_script(&self, command_line: &str, script: Script) {
        self.scripts
            .write()
            .insert(command_line.to_string(), script);
    }

    /// Push a ready announcement directly, bypassing any script.
    pub fn announce_ready(&self, ready: ServerReady) {
        self.ready_tx.send_replace(Some(ready));
    }

    pub fn seed_file(&self, path: &str, contents: &str) {
        self.files
            .write()
            .insert(normalize(path), contents.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.read().get(&normalize(path)).cloned()
    }

    /// Paths that went through `write_file`, in call order.
    pub fn written_paths(&self) -> Vec<String> {
        self.written.lock().clone()
    }

    /// Command lines that went through `spawn`, in call order.
    pub fn spawned_commands(&self) -> Vec<String> {
        self.spawned.lock().clone()
    }
}

impl Default for InMemorySandbox {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").trim_start_matches('/').to_string()
}

fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[async_trait]
impl SandboxRuntime for InMemorySandbox {
    async fn mount(&self, tree: &MountTree) -> Result<(), SandboxError> {
        let flat = mount_tree::flatten(tree);
        let mut files = self.files.write();
        for (path, contents) in flat {
            files.insert(path, contents);
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.file(path)
            .ok_or_else(|| SandboxError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), SandboxError> {
        let path = normalize(path);
        self.written.lock().push(path.clone());
        self.files.write().insert(path, contents.to_string());
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError> {
        let files = self.files.read();
        let prefix = match path {
            "." | "" | "/" => String::new(),
            dir => format!("{}/", dir.trim_matches('/')),
        };
        let mut names: BTreeMap<String, bool> = BTreeMap::new();
        for file_path in files.keys() {
            let Some(rest) = file_path.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                Some((head, _)) => {
                    names.insert(head.to_string(), true);
                }
                None => {
                    names.entry(rest.to_string()).or_insert(false);
                }
            }
        }
        Ok(names
            .into_iter()
            .map(|(name, is_directory)| DirEntry { name, is_directory })
            .collect())
    }

    async fn spawn(&self, program: &str, args: &[&str]) -> Result<SandboxProcess, SandboxError> {
        let key = command_line(program, args);
        self.spawned.lock().push(key.clone());
        let script = self
            .scripts
            .read()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Script::succeeds(&[]));
        tracing::debug!(target: "atelier::sandbox", command = key, "spawning scripted process");

        {
            let mut files = self.files.write();
            for (path, contents) in &script.creates {
                files.insert(normalize(path), contents.clone());
            }
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let exit_tx = if script.exit_code.is_none() {
            self.held_exits.lock().push(exit_tx);
            None
        } else {
            Some(exit_tx)
        };

        let ready_tx = self.ready_tx.clone();
        tokio::spawn(async move {
            for chunk in script.output {
                if out_tx.send(chunk).is_err() {
                    return;
                }
            }
            if let Some(ready) = script.announce {
                ready_tx.send_replace(Some(ready));
            }
            if let (Some(tx), Some(code)) = (exit_tx, script.exit_code) {
                let _ = tx.send(code);
            }
        });

        Ok(SandboxProcess {
            output: out_rx,
            exit: exit_rx,
        })
    }

    fn server_ready(&self) -> watch::Receiver<Option<ServerReady>> {
        self.ready_rx.clone()
    }
}
