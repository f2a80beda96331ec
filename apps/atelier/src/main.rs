use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use atelier_client_core::cache::CacheNotice;
use atelier_client_core::channel::ChannelStatus;
use atelier_client_core::config::Config;
use atelier_client_core::sandbox::{InMemorySandbox, PreviewMode, SessionStatus};
use atelier_client_core::telemetry::logging::{LogConfig, LogLevel};
use atelier_client_core::workspace::WorkspaceSession;

#[derive(Parser, Debug)]
#[command(
    name = "atelier",
    about = "Workspace synchronization and preview bootstrap engine"
)]
struct Cli {
    /// Workspace id to attach to
    #[arg(long, short = 'w')]
    workspace: String,

    /// Build and serve a production bundle instead of the dev server
    #[arg(long)]
    production: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_config = LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    };
    if let Err(err) = atelier_client_core::telemetry::logging::init(&log_config) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    let config = Config::from_env();
    let mode = if cli.production {
        PreviewMode::Production
    } else {
        PreviewMode::Dev
    };
    // The preview runs against the built-in runtime; real execution sandboxes
    // are embedded by the browser host, not by this driver.
    let runtime = Arc::new(InMemorySandbox::with_default_node_scripts());

    let (session, mut streams) = match WorkspaceSession::spawn(&config, &cli.workspace, runtime, mode)
    {
        Ok(started) => started,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let mut connection = session.connection_status();
    let mut preview = session.preview_status();
    let mut server_url = session.server_url();

    loop {
        tokio::select! {
            line = streams.terminal.recv() => {
                let Some(line) = line else { break };
                println!("{line}");
            }
            notice = streams.notices.recv() => {
                let Some(notice) = notice else { break };
                match notice {
                    CacheNotice::Notification(message) => println!("notice: {message}"),
                    CacheNotice::RemoteError(error) => eprintln!("server error: {error}"),
                    CacheNotice::EditConflict { path } => {
                        eprintln!("edit conflict on {path}: kept the local version")
                    }
                    CacheNotice::Evicted => {
                        eprintln!("workspace was deleted; leaving");
                        return ExitCode::FAILURE;
                    }
                }
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *connection.borrow();
                eprintln!("connection: {}", status.as_str());
                if status == ChannelStatus::ConnectionFailed {
                    eprintln!("reconnect attempts exhausted; run again or check the service");
                    return ExitCode::FAILURE;
                }
            }
            changed = preview.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *preview.borrow();
                eprintln!("preview: {}", status.as_str());
                if status == SessionStatus::Failed {
                    if let Some(error) = session.setup_error() {
                        eprintln!("setup failed: {error}");
                    }
                }
            }
            changed = server_url.changed() => {
                if changed.is_err() {
                    break;
                }
                let url = server_url.borrow().clone();
                if !url.is_empty() {
                    println!("preview ready at {url}");
                }
            }
        }
    }
    ExitCode::SUCCESS
}
