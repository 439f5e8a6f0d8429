// clicker-daemon: keeps one channel listener alive in the background
//
// Responsibilities:
// - Own the session supervisor and the durable listen state
// - Resume listening after a restart when the user left it on
// - Expose the Unix socket protocol for the CLI
// - Broadcast lifecycle changes to every connected client

use anyhow::{anyhow, Context, Result};
use clicker_lib::session::{
    channel::WsConnector,
    config::Config,
    error::SessionError,
    lifecycle::LifecycleSubscription,
    notify::default_cue,
    persistence::FileStore,
    protocol::{
        deserialize_message, serialize_message, ChannelId, DaemonErrorCode, DaemonNotification,
        DaemonRequest, DaemonResponse, SupervisorStatus, MAX_REQUEST_FRAME_SIZE,
        PROTOCOL_VERSION,
    },
    supervisor::{Supervisor, SupervisorHandle},
};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing_subscriber::{fmt, EnvFilter};

/// Upper bound on waiting for the live socket to close during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Daemon state shared across all client connections
struct DaemonState {
    supervisor: SupervisorHandle,
    /// Lifecycle notifications fanned out to clients
    updates_tx: broadcast::Sender<DaemonNotification>,
}

impl DaemonState {
    fn new(supervisor: SupervisorHandle) -> Self {
        let (updates_tx, _) = broadcast::channel(64);
        Self {
            supervisor,
            updates_tx,
        }
    }

    /// Relay supervisor lifecycle events to socket clients
    fn forward_lifecycle(self: &Arc<Self>, mut events: LifecycleSubscription) {
        let updates_tx = self.updates_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                tracing::debug!(%event, "broadcasting lifecycle event");
                // No connected clients is fine
                let _ = updates_tx.send(DaemonNotification::Lifecycle { event });
            }
        });
    }
}

async fn handle_client(
    state: Arc<DaemonState>,
    mut stream: UnixStream,
    shutdown_tx: mpsc::Sender<()>,
) -> Result<()> {
    let (reader, mut writer) = stream.split();
    // The codec keeps partial lines across select! cancellations and refuses
    // to buffer past the frame limit
    let mut frames = FramedRead::new(
        reader,
        LinesCodec::new_with_max_length(MAX_REQUEST_FRAME_SIZE),
    );

    // Subscribe before serving so nothing published after connect is missed
    let mut updates_rx = state.updates_tx.subscribe();

    loop {
        tokio::select! {
            frame = frames.next() => {
                let response = match frame {
                    None => break,
                    Some(Ok(line)) => match deserialize_message::<DaemonRequest>(line.as_bytes()) {
                        Ok(request) => handle_request(&state, request, &shutdown_tx).await,
                        Err(e) => DaemonResponse::Error {
                            code: DaemonErrorCode::InvalidRequest,
                            message: format!("Failed to parse request: {}", e),
                        },
                    },
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        // The stream ends after a codec error; answer, then hang up
                        let response = DaemonResponse::Error {
                            code: DaemonErrorCode::InvalidRequest,
                            message: format!(
                                "Request frame too large (max {} bytes)",
                                MAX_REQUEST_FRAME_SIZE
                            ),
                        };
                        writer.write_all(&serialize_message(&response)?).await?;
                        writer.flush().await?;
                        break;
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        tracing::warn!(error = %e, "error reading from client");
                        break;
                    }
                };

                let bytes = serialize_message(&response)?;
                writer.write_all(&bytes).await?;
                writer.flush().await?;
            }

            result = updates_rx.recv() => {
                match result {
                    Ok(notification) => {
                        let bytes = serialize_message(&notification)?;
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                        let _ = writer.flush().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "client lagging, dropped notifications");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}

async fn handle_request(
    state: &Arc<DaemonState>,
    request: DaemonRequest,
    shutdown_tx: &mpsc::Sender<()>,
) -> DaemonResponse {
    match request {
        DaemonRequest::Handshake { client_version } => {
            if client_version != PROTOCOL_VERSION {
                let message = if client_version < PROTOCOL_VERSION {
                    "Daemon is newer than the CLI, please update the CLI.".to_string()
                } else {
                    "Daemon is outdated, please restart it.".to_string()
                };
                return DaemonResponse::Error {
                    code: DaemonErrorCode::VersionMismatch,
                    message,
                };
            }
            DaemonResponse::Handshake {
                protocol_version: PROTOCOL_VERSION,
            }
        }

        DaemonRequest::Ping => DaemonResponse::Pong,

        DaemonRequest::Shutdown => {
            let _ = shutdown_tx.send(()).await;
            DaemonResponse::ShuttingDown
        }

        DaemonRequest::Start { channel_id } => match ChannelId::new(channel_id) {
            Ok(channel_id) => status_response(state.supervisor.start(channel_id).await),
            Err(e) => DaemonResponse::Error {
                code: DaemonErrorCode::InvalidRequest,
                message: e.to_string(),
            },
        },

        DaemonRequest::Stop => status_response(state.supervisor.stop().await),

        DaemonRequest::Status => status_response(state.supervisor.status().await),
    }
}

fn status_response(result: Result<SupervisorStatus, SessionError>) -> DaemonResponse {
    match result {
        Ok(status) => DaemonResponse::Status { status },
        Err(SessionError::SupervisorUnavailable) => DaemonResponse::Error {
            code: DaemonErrorCode::SupervisorUnavailable,
            message: SessionError::SupervisorUnavailable.to_string(),
        },
        Err(e) => DaemonResponse::Error {
            code: DaemonErrorCode::Internal,
            message: e.to_string(),
        },
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!(e))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let config = Config::from_env();

    config
        .ensure_dirs()
        .context("Failed to create data directory")?;

    // Clean up stale socket if exists
    if config.socket_exists() {
        if config.is_daemon_running() {
            tracing::error!(pid = ?config.read_pid(), "daemon already running");
            std::process::exit(1);
        }
        config
            .remove_socket()
            .context("Failed to remove stale socket")?;
    }

    config.write_pid().context("Failed to write PID file")?;

    let store = Arc::new(FileStore::from_config(&config));
    let connector = Arc::new(WsConnector::new(config.endpoint.clone(), config.channel));
    let cue = default_cue(&config.cue);
    let supervisor = Supervisor::new(store, connector, cue);
    let events = supervisor.subscribe();
    let (handle, supervisor_task) = supervisor.spawn();

    let state = Arc::new(DaemonState::new(handle.clone()));
    state.forward_lifecycle(events);

    match handle.on_restart().await {
        Ok(status) => tracing::info!(state = %status.state, channel = %status.channel_id, "restored listen state"),
        Err(e) => tracing::warn!(error = %e, "could not restore listen state"),
    }

    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("Failed to bind socket: {}", config.socket_path.display()))?;

    // Owner-only access
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| {
                format!(
                    "Failed to set socket permissions: {}",
                    config.socket_path.display()
                )
            })?;
    }

    tracing::info!(
        socket = %config.socket_path.display(),
        host = %config.endpoint.host,
        "daemon listening"
    );

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        let _ = shutdown_tx_clone.send(()).await;
    });

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let state = Arc::clone(&state);
                        let shutdown_tx = shutdown_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(state, stream, shutdown_tx).await {
                                tracing::warn!(error = %e, "client error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept error"),
                }
            }

            _ = shutdown_rx.recv() => {
                tracing::info!("shutting down daemon");
                break;
            }
        }
    }

    // The durable pair is left alone so the next start resumes listening
    handle.shutdown().await;
    if tokio::time::timeout(SHUTDOWN_GRACE, supervisor_task)
        .await
        .is_err()
    {
        tracing::warn!("listener did not close in time");
    }

    config.remove_pid().ok();
    config.remove_socket().ok();

    tracing::info!("daemon stopped");
    Ok(())
}
