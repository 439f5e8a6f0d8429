// Shared by several integration test crates; not every crate uses every helper
#![allow(dead_code)]

pub mod channel_server;
pub mod daemon_guard;
