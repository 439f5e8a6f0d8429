// Error taxonomy for the listener and trigger paths
// None of these are fatal to the daemon: each one resolves to Idle or to a
// failure returned to the immediate caller.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// A channel id was empty after trimming
    #[error("channel id must not be empty")]
    EmptyChannelId,

    /// Transport-level failure to establish the listen session
    #[error("failed to connect to channel '{channel_id}': {reason}")]
    ConnectFailure { channel_id: String, reason: String },

    /// The server ended an established session
    #[error("channel '{channel_id}' was closed by the server: {reason}")]
    RemoteClose { channel_id: String, reason: String },

    /// The one-shot click request did not succeed
    #[error("click on channel '{channel_id}' failed: {reason}")]
    TriggerFailure { channel_id: String, reason: String },

    /// desired_connected was set without a channel id
    #[error("persisted state asks for a connection but has no channel id")]
    InconsistentPersistedState,

    /// The supervisor task is gone (daemon shutting down)
    #[error("supervisor is not running")]
    SupervisorUnavailable,
}
