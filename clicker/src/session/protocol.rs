// Session protocol - shared structs for daemon <-> CLI communication
// Uses framed JSON messages over Unix sockets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::error::SessionError;
use crate::session::lifecycle::LifecycleEvent;

/// Protocol version checked during the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of a single request line (64KB)
pub const MAX_REQUEST_FRAME_SIZE: usize = 64 * 1024;

/// Maximum size of a single response line (1MB)
pub const MAX_RESPONSE_FRAME_SIZE: usize = 1024 * 1024;

/// Server-side routing key that listeners subscribe to and clicks publish to.
///
/// Opaque and compared by exact string match. The only local rule is that it
/// must not be empty; the server decides whether an id is otherwise valid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Result<Self, SessionError> {
        let id = id.into();
        if id.is_empty() {
            return Err(SessionError::EmptyChannelId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChannelId {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection state of the supervisor's single channel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SessionState {
    /// No session and none requested
    Idle,
    /// A session was opened and is waiting for the server to accept it
    Connecting,
    /// The server accepted the session; cues are being delivered
    Active,
    /// A live session is being shut down
    Closing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Closing => write!(f, "Closing"),
        }
    }
}

/// Snapshot of the supervisor reported to control surfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: SessionState,
    /// Channel of the live session, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_channel: Option<String>,
    /// Durable intent flag as last written
    pub desired_connected: bool,
    /// Durable channel id (kept after a stop for convenience)
    pub channel_id: String,
    /// Why the last session ended, if it ended abnormally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the state last changed
    pub updated_at: DateTime<Utc>,
}

/// Machine-readable error codes carried by `DaemonResponse::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonErrorCode {
    InvalidRequest,
    VersionMismatch,
    SupervisorUnavailable,
    Internal,
}

// ============================================================================
// Client -> Daemon requests
// ============================================================================

/// Request message from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// Must be the first frame on every connection
    Handshake { client_version: u32 },
    /// Start listening on a channel
    Start { channel_id: String },
    /// Stop listening
    Stop,
    /// Current supervisor status
    Status,
    /// Ping to check if daemon is alive
    Ping,
    /// Request daemon to shut down gracefully
    Shutdown,
}

// ============================================================================
// Daemon -> Client responses
// ============================================================================

/// Response message from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
    Handshake { protocol_version: u32 },
    /// Reply to start, stop and status
    Status { status: SupervisorStatus },
    Pong,
    ShuttingDown,
    Error {
        code: DaemonErrorCode,
        message: String,
    },
}

// ============================================================================
// Daemon -> Client push notifications (broadcast)
// ============================================================================

/// Push notification from daemon to every connected client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonNotification {
    Lifecycle { event: LifecycleEvent },
}

// ============================================================================
// Helpers for message framing
// ============================================================================

/// Serialize a message to JSON bytes with newline delimiter
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Deserialize a message from JSON bytes (strips trailing newline)
pub fn deserialize_message<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> Result<T, serde_json::Error> {
    let trimmed = if bytes.last() == Some(&b'\n') {
        &bytes[..bytes.len() - 1]
    } else {
        bytes
    };
    serde_json::from_slice(trimmed)
}
