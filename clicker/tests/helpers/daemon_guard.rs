use clicker_lib::session::config::Config;
use std::fmt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_DELAY_MS: u64 = 20;
const MAX_DELAY_MS: u64 = 500;

/// RAII wrapper that ensures the daemon process is cleaned up.
pub struct DaemonGuard {
    child: Child,
    config: Config,
}

impl DaemonGuard {
    /// Start the compiled daemon with all of its files under `data_dir`,
    /// talking to the channel server at `host` over plain ws/http.
    pub fn start(data_dir: &Path, host: &str) -> Result<Self, DaemonError> {
        let daemon_bin = daemon_binary();
        if !daemon_bin.is_file() {
            return Err(DaemonError::BinaryNotFound(daemon_bin));
        }

        let child = Command::new(&daemon_bin)
            .env("CLICKER_DAEMON_DIR", data_dir)
            .env("CLICKER_HOST", host)
            .env("CLICKER_INSECURE", "1")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(DaemonError::SpawnFailed)?;

        let guard = Self {
            child,
            config: Config::in_dir(data_dir),
        };
        guard.wait_for_ready()?;
        Ok(guard)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Wait for the process to exit on its own
    pub fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return true;
            }
            thread::sleep(Duration::from_millis(INITIAL_DELAY_MS));
        }
        false
    }

    fn wait_for_ready(&self) -> Result<(), DaemonError> {
        let start = Instant::now();
        let mut delay = Duration::from_millis(INITIAL_DELAY_MS);

        while start.elapsed() < READY_TIMEOUT {
            if UnixStream::connect(&self.config.socket_path).is_ok() {
                return Ok(());
            }
            thread::sleep(delay);
            delay = (delay * 2).min(Duration::from_millis(MAX_DELAY_MS));
        }

        Err(DaemonError::ReadyTimeout(self.config.socket_path.clone()))
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        if let Err(err) = self.child.kill() {
            eprintln!(
                "Failed to terminate clicker-daemon pid {}: {}",
                self.child.id(),
                err
            );
            return;
        }

        let _ = self.child.wait();
    }
}

fn daemon_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_clicker-daemon"))
}

/// Errors that can occur when starting the daemon for tests.
#[derive(Debug)]
pub enum DaemonError {
    BinaryNotFound(PathBuf),
    SpawnFailed(std::io::Error),
    ReadyTimeout(PathBuf),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BinaryNotFound(path) => {
                write!(f, "clicker-daemon binary not found at {}", path.display())
            }
            Self::SpawnFailed(err) => write!(f, "failed to spawn daemon: {}", err),
            Self::ReadyTimeout(socket) => {
                write!(f, "daemon never bound its socket at {}", socket.display())
            }
        }
    }
}

impl std::error::Error for DaemonError {}
