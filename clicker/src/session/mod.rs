// Listener session modules shared by the daemon and the CLI

pub mod channel;
pub mod config;
pub mod control;
pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod persistence;
pub mod protocol;
pub mod supervisor;
pub mod trigger;

// Daemon client (Unix only for now)
#[cfg(unix)]
pub mod daemon_client;
