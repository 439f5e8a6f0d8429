// Listener supervisor, channel session and control protocol shared by
// clicker-daemon and the clicker CLI

pub mod session;

// Polling helpers for async tests (used by unit and integration tests)
pub mod test_utils;
