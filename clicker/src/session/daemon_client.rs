// Blocking client for the clicker-daemon control socket
// Used by the CLI; starts the daemon on demand when autostart is set

use super::config::Config;
use super::lifecycle::LifecycleEvent;
use super::protocol::{
    deserialize_message, serialize_message, ChannelId, DaemonErrorCode, DaemonNotification,
    DaemonRequest, DaemonResponse, SessionState, SupervisorStatus, MAX_RESPONSE_FRAME_SIZE,
    PROTOCOL_VERSION,
};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

const DAEMON_BINARY: &str = "clicker-daemon";
const STARTUP_WAIT: Duration = Duration::from_secs(5);
const STARTUP_POLL: Duration = Duration::from_millis(100);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Find the daemon binary: next to the current executable, then on PATH
pub fn resolve_daemon_path() -> Option<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(DAEMON_BINARY);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(DAEMON_BINARY))
            .find(|candidate| candidate.is_file())
    })
}

/// How a start request settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenOutcome {
    Listening,
    /// The session ended, with the reason if it ended abnormally
    Stopped(Option<String>),
}

/// One handshaken connection to the daemon
pub struct DaemonClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    /// Notifications that arrived while waiting for a response
    pending: VecDeque<DaemonNotification>,
}

impl DaemonClient {
    /// Connect and handshake. With `autostart`, a missing daemon is spawned
    /// in the background and given a few seconds to bind its socket.
    pub fn connect(config: &Config, autostart: bool) -> Result<Self> {
        let stream = match UnixStream::connect(&config.socket_path) {
            Ok(stream) => stream,
            Err(e) if !autostart => {
                return Err(e).with_context(|| {
                    format!(
                        "Daemon is not running (socket: {})",
                        config.socket_path.display()
                    )
                })
            }
            Err(_) => start_daemon(config)?,
        };
        Self::handshake(stream)
    }

    fn handshake(stream: UnixStream) -> Result<Self> {
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .context("Failed to set read timeout")?;
        let writer = stream.try_clone().context("Failed to clone daemon socket")?;
        let mut client = Self {
            reader: BufReader::new(stream),
            writer,
            pending: VecDeque::new(),
        };

        match client.request(DaemonRequest::Handshake {
            client_version: PROTOCOL_VERSION,
        })? {
            DaemonResponse::Handshake { .. } => Ok(client),
            DaemonResponse::Error {
                code: DaemonErrorCode::VersionMismatch,
                message,
            } => Err(anyhow::anyhow!("Protocol version mismatch: {}", message)),
            other => Err(anyhow::anyhow!(
                "Expected handshake response, got: {:?}",
                other
            )),
        }
    }

    /// Send one request and wait for its response
    pub fn request(&mut self, request: DaemonRequest) -> Result<DaemonResponse> {
        // next_notification may have lifted the timeout
        self.reader
            .get_ref()
            .set_read_timeout(Some(READ_TIMEOUT))
            .context("Failed to set read timeout")?;

        let bytes = serialize_message(&request).context("Failed to serialize request")?;
        self.writer
            .write_all(&bytes)
            .context("Failed to send request to daemon")?;
        self.writer.flush().context("Failed to flush daemon socket")?;

        loop {
            let line = self.read_frame()?;
            if let Ok(notification) = deserialize_message::<DaemonNotification>(line.as_bytes()) {
                self.pending.push_back(notification);
                continue;
            }
            return deserialize_message::<DaemonResponse>(line.as_bytes()).with_context(|| {
                format!("Failed to parse daemon response (line: {})", line.trim())
            });
        }
    }

    /// Block until the daemon pushes a notification. None when it hangs up.
    pub fn next_notification(&mut self) -> Result<Option<DaemonNotification>> {
        if let Some(notification) = self.pending.pop_front() {
            return Ok(Some(notification));
        }

        self.reader
            .get_ref()
            .set_read_timeout(None)
            .context("Failed to clear read timeout")?;

        loop {
            let line = match self.read_frame() {
                Ok(line) => line,
                Err(e) if is_closed(&e) => return Ok(None),
                Err(e) => return Err(e),
            };
            match deserialize_message::<DaemonNotification>(line.as_bytes()) {
                Ok(notification) => return Ok(Some(notification)),
                Err(_) => tracing::debug!(line = line.trim(), "ignoring unexpected frame"),
            }
        }
    }

    /// Block until a start for `channel_id` settles. `accepted` is the status
    /// the daemon answered the start with; a session that is already open, or
    /// already over, settles without waiting for a notification.
    pub fn wait_for_listen(
        &mut self,
        channel_id: &ChannelId,
        accepted: &SupervisorStatus,
    ) -> Result<ListenOutcome> {
        match accepted.state {
            SessionState::Active
                if accepted.live_channel.as_deref() == Some(channel_id.as_str()) =>
            {
                return Ok(ListenOutcome::Listening)
            }
            SessionState::Idle => return Ok(ListenOutcome::Stopped(accepted.last_error.clone())),
            _ => {}
        }

        while let Some(DaemonNotification::Lifecycle { event }) = self.next_notification()? {
            match event {
                LifecycleEvent::Started { channel_id: id } if id == channel_id.as_str() => {
                    return Ok(ListenOutcome::Listening)
                }
                LifecycleEvent::Started { .. } => continue,
                LifecycleEvent::Stopped => {
                    let reason = self
                        .request(DaemonRequest::Status)
                        .ok()
                        .and_then(|response| expect_status(response).ok())
                        .and_then(|status| status.last_error);
                    return Ok(ListenOutcome::Stopped(reason));
                }
            }
        }
        anyhow::bail!("Daemon went away before the connection settled")
    }

    fn read_frame(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .context("Failed to read from daemon")?;
        if read == 0 {
            return Err(anyhow::Error::new(ConnectionClosed));
        }
        if line.len() > MAX_RESPONSE_FRAME_SIZE {
            anyhow::bail!(
                "Response frame too large: {} bytes (max {})",
                line.len(),
                MAX_RESPONSE_FRAME_SIZE
            );
        }
        Ok(line)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Daemon closed connection unexpectedly")]
struct ConnectionClosed;

fn is_closed(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ConnectionClosed>().is_some()
}

fn start_daemon(config: &Config) -> Result<UnixStream> {
    let daemon_path = resolve_daemon_path().ok_or_else(|| {
        anyhow::anyhow!(
            "Could not find {} next to this executable or on PATH",
            DAEMON_BINARY
        )
    })?;
    tracing::info!(path = %daemon_path.display(), "daemon not running, starting it");

    Command::new(&daemon_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to start daemon at {}", daemon_path.display()))?;

    let deadline = std::time::Instant::now() + STARTUP_WAIT;
    while std::time::Instant::now() < deadline {
        std::thread::sleep(STARTUP_POLL);
        if let Ok(stream) = UnixStream::connect(&config.socket_path) {
            return Ok(stream);
        }
    }

    Err(anyhow::anyhow!(
        "Daemon did not start within {}s (socket not found at: {})",
        STARTUP_WAIT.as_secs(),
        config.socket_path.display()
    ))
}

/// Unwrap a status reply, turning daemon errors into anyhow errors
pub fn expect_status(response: DaemonResponse) -> Result<SupervisorStatus> {
    match response {
        DaemonResponse::Status { status } => Ok(status),
        DaemonResponse::Error { code, message } => {
            Err(anyhow::anyhow!("Daemon error ({:?}): {}", code, message))
        }
        other => Err(anyhow::anyhow!("Unexpected response from daemon: {:?}", other)),
    }
}
