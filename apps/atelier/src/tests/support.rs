use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use parking_lot::Mutex;
use tokio::sync::watch;

use workspace_proto::{ClientCommand, FileNode, NodeKind, ServerEvent};

use crate::channel::CommandSink;

pub fn file_node(path: &str) -> FileNode {
    FileNode {
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        path: path.to_string(),
        kind: NodeKind::File,
        children: None,
        content: None,
    }
}

pub fn dir_node(path: &str, children: Vec<FileNode>) -> FileNode {
    FileNode {
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        path: path.to_string(),
        kind: NodeKind::Directory,
        children: Some(children),
        content: None,
    }
}

/// The standard fixture project: a manifest plus two source files.
pub fn sample_tree() -> Vec<FileNode> {
    vec![
        file_node("package.json"),
        dir_node(
            "src",
            vec![file_node("src/main.tsx"), file_node("src/App.tsx")],
        ),
    ]
}

/// Command sink that records instead of sending.
#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<ClientCommand>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<ClientCommand> {
        self.sent.lock().clone()
    }
}

impl CommandSink for RecordingSink {
    fn send_command(&self, command: &ClientCommand) -> bool {
        self.sent.lock().push(command.clone());
        true
    }
}

/// Poll a predicate until it holds; panics after ~5s so failures surface as
/// assertions rather than harness timeouts.
pub async fn eventually(mut predicate: impl FnMut() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub async fn wait_for<T: PartialEq + Copy>(rx: &mut watch::Receiver<T>, want: T) {
    loop {
        if *rx.borrow() == want {
            return;
        }
        rx.changed().await.expect("watch channel closed");
    }
}

/// Loopback stand-in for the workspace service: greets every connection with
/// a tree snapshot and answers `open_file` with deterministic content.
#[derive(Default)]
pub struct FakeService {
    pub connections: AtomicUsize,
    pub pings: AtomicUsize,
    pub open_requests: Mutex<Vec<(String, bool)>>,
}

impl FakeService {
    pub fn open_count(&self) -> usize {
        self.open_requests.lock().len()
    }
}

pub fn content_for(path: &str) -> String {
    format!("// {path}")
}

async fn handle_socket(mut socket: WebSocket, service: Arc<FakeService>) {
    service.connections.fetch_add(1, Ordering::SeqCst);
    let greeting = ServerEvent::Tree {
        items: sample_tree(),
    };
    if send_event(&mut socket, &greeting).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Ping(_) => {
                service.pings.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            _ => continue,
        };
        let Ok(command) = serde_json::from_str::<ClientCommand>(&text) else {
            continue;
        };
        match command {
            ClientCommand::OpenFile { path, silent } => {
                service.open_requests.lock().push((path.clone(), silent));
                let reply = ServerEvent::FileContent {
                    content: content_for(&path),
                    path,
                };
                if send_event(&mut socket, &reply).await.is_err() {
                    return;
                }
            }
            ClientCommand::GetTree => {
                let reply = ServerEvent::Tree {
                    items: sample_tree(),
                };
                if send_event(&mut socket, &reply).await.is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).expect("event serializes");
    socket.send(Message::Text(json)).await
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(service): State<Arc<FakeService>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, service))
}

/// Serve the fake service on an ephemeral port; returns its state and the
/// bound address.
pub async fn spawn_fake_service() -> (Arc<FakeService>, std::net::SocketAddr) {
    let service = Arc::new(FakeService::default());
    let app = Router::new()
        .route("/ws/workspace/:id/", get(ws_handler))
        .with_state(service.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (service, addr)
}
