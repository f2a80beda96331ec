use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

pub const DEFAULT_WORKSPACE_SERVER: &str = "127.0.0.1:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("workspace server base url cannot be empty")]
    EmptyServer,
    #[error("invalid workspace server url: {0}")]
    InvalidServer(String),
    #[error("workspace id cannot be empty")]
    EmptyWorkspaceId,
}

/// Engine configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base address of the workspace service, with or without a scheme.
    pub workspace_server: String,
    /// Delay between consecutive silent prefetch requests.
    pub prefetch_stagger: Duration,
    /// Outbound heartbeat period while the channel is open.
    pub heartbeat_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let server = env::var("ATELIER_WORKSPACE_SERVER")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_WORKSPACE_SERVER.to_string());
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let server = if server.starts_with("localhost:") {
            server.replacen("localhost", "127.0.0.1", 1)
        } else {
            server
        };
        Self {
            workspace_server: server,
            prefetch_stagger: duration_ms_var("ATELIER_PREFETCH_STAGGER_MS", 50),
            heartbeat_interval: duration_secs_var("ATELIER_HEARTBEAT_SECS", 30),
        }
    }

    /// Resolve the duplex endpoint for a workspace id. The HTTP(S) base maps
    /// to ws(s) and the path is fixed, so one id always yields one URL.
    pub fn workspace_endpoint(&self, workspace_id: &str) -> Result<Url, ConfigError> {
        if workspace_id.trim().is_empty() {
            return Err(ConfigError::EmptyWorkspaceId);
        }
        let mut base = self.workspace_server.trim().to_string();
        if base.is_empty() {
            return Err(ConfigError::EmptyServer);
        }
        if !base.contains("://") {
            base = format!("{}{base}", infer_scheme(&base));
        }
        let parsed =
            Url::parse(&base).map_err(|err| ConfigError::InvalidServer(err.to_string()))?;
        let ws_scheme = match parsed.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidServer("missing host".into()))?;
        let authority = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let endpoint = format!("{ws_scheme}://{authority}/ws/workspace/{workspace_id}/");
        Url::parse(&endpoint).map_err(|err| ConfigError::InvalidServer(err.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_server: DEFAULT_WORKSPACE_SERVER.to_string(),
            prefetch_stagger: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

fn infer_scheme(base: &str) -> &'static str {
    if base.starts_with("127.0.0.1") || base.starts_with("localhost") || base.starts_with("0.0.0.0")
    {
        "http://"
    } else {
        "https://"
    }
}

fn duration_ms_var(var: &str, default_ms: u64) -> Duration {
    let ms = env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

fn duration_secs_var(var: &str, default_secs: u64) -> Duration {
    let secs = env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}
