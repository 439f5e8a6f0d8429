// Environment configuration helpers for the daemon and CLI
// Handles platform-specific paths for sockets, PID files, and state, plus the
// server endpoint and cue settings

use std::path::PathBuf;
use std::time::Duration;

use crate::session::channel::Endpoint;

/// Server that hosts the channels when CLICKER_HOST is unset
pub const DEFAULT_HOST: &str = "clickertrain.ing";

/// The server heartbeats every 10s, so two missed beats means the link is dead
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Timeouts applied to each channel session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Give up on a connection attempt after this long (None = wait for the transport)
    pub connect_timeout: Option<Duration>,
    /// Fail an open session that has been silent this long (None = never)
    pub idle_timeout: Option<Duration>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

/// How the cue sounds
#[derive(Debug, Clone, PartialEq)]
pub struct CueSettings {
    /// Audio file to play; a synthesized click is used when unset
    pub sound_file: Option<PathBuf>,
    pub volume: f32,
}

impl Default for CueSettings {
    fn default() -> Self {
        Self {
            sound_file: None,
            volume: 1.0,
        }
    }
}

/// Configuration for daemon paths and settings
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for storing runtime files (socket, PID)
    pub runtime_dir: PathBuf,
    /// Directory for storing persistent state (listen_state.json)
    pub state_dir: PathBuf,
    /// Path to the Unix socket
    pub socket_path: PathBuf,
    /// Path to the daemon PID file
    pub pid_file: PathBuf,
    pub endpoint: Endpoint,
    pub channel: ChannelSettings,
    pub cue: CueSettings,
}

impl Config {
    /// Create configuration using default paths
    pub fn default_paths() -> Self {
        let runtime_dir = Self::default_runtime_dir();
        let state_dir = Self::default_state_dir();

        Self {
            socket_path: runtime_dir.join("daemon.sock"),
            pid_file: runtime_dir.join("daemon.pid"),
            runtime_dir,
            state_dir,
            endpoint: Endpoint::new(DEFAULT_HOST, true),
            channel: ChannelSettings::default(),
            cue: CueSettings::default(),
        }
    }

    /// Put every file under one directory (used by CLICKER_DAEMON_DIR and tests)
    pub fn in_dir(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            socket_path: base.join("daemon.sock"),
            pid_file: base.join("daemon.pid"),
            runtime_dir: base.clone(),
            state_dir: base,
            endpoint: Endpoint::new(DEFAULT_HOST, true),
            channel: ChannelSettings::default(),
            cue: CueSettings::default(),
        }
    }

    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        // CLICKER_DAEMON_DIR overrides BOTH runtime_dir and state_dir
        let mut config = match std::env::var("CLICKER_DAEMON_DIR") {
            Ok(dir) if !dir.is_empty() => Self::in_dir(dir),
            _ => Self::default_paths(),
        };

        if let Ok(host) = std::env::var("CLICKER_HOST") {
            if !host.trim().is_empty() {
                config.endpoint.host = host.trim().to_string();
            }
        }
        if env_flag("CLICKER_INSECURE") {
            config.endpoint.secure = false;
        }

        if let Some(secs) = env_secs("CLICKER_CONNECT_TIMEOUT_SECS") {
            config.channel.connect_timeout = secs;
        }
        if let Some(secs) = env_secs("CLICKER_IDLE_TIMEOUT_SECS") {
            config.channel.idle_timeout = secs;
        }

        if let Ok(sound) = std::env::var("CLICKER_SOUND") {
            if !sound.is_empty() {
                config.cue.sound_file = Some(PathBuf::from(sound));
            }
        }
        if let Some(volume) = std::env::var("CLICKER_VOLUME")
            .ok()
            .and_then(|v| v.trim().parse::<f32>().ok())
        {
            config.cue.volume = volume.max(0.0);
        }

        config
    }

    /// Get the default runtime directory (socket + pid)
    fn default_runtime_dir() -> PathBuf {
        #[cfg(target_os = "linux")]
        {
            // Linux: prefer XDG_RUNTIME_DIR if set, else fall back to state_dir
            if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
                PathBuf::from(runtime_dir).join("clicker")
            } else {
                Self::default_state_dir()
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::default_state_dir()
        }
    }

    /// Get the default state directory (listen_state.json)
    fn default_state_dir() -> PathBuf {
        // All platforms: ~/.clicker/ (or /tmp/clicker if home unavailable)
        dirs::home_dir()
            .map(|h| h.join(".clicker"))
            .unwrap_or_else(|| PathBuf::from("/tmp/clicker"))
    }

    pub fn runtime_dir(&self) -> &PathBuf {
        &self.runtime_dir
    }

    pub fn state_dir(&self) -> &PathBuf {
        &self.state_dir
    }

    /// File holding the durable pair
    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("listen_state.json")
    }

    /// Ensure both runtime and state directories exist with appropriate permissions
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(&self.runtime_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.runtime_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }

    /// Write the daemon PID to the PID file
    pub fn write_pid(&self) -> std::io::Result<()> {
        self.ensure_dirs()?;
        std::fs::write(&self.pid_file, std::process::id().to_string())
    }

    /// Read the daemon PID from the PID file
    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Remove the PID file
    pub fn remove_pid(&self) -> std::io::Result<()> {
        if self.pid_file.exists() {
            std::fs::remove_file(&self.pid_file)
        } else {
            Ok(())
        }
    }

    /// Remove the socket file
    pub fn remove_socket(&self) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
        } else {
            Ok(())
        }
    }

    /// Check if the daemon socket exists (indicating daemon may be running)
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Check if a process with the stored PID is still running
    #[cfg(unix)]
    pub fn is_daemon_running(&self) -> bool {
        if let Some(pid) = self.read_pid() {
            // Signal 0 only checks that the process exists
            unsafe { libc::kill(pid as i32, 0) == 0 }
        } else {
            false
        }
    }

    #[cfg(not(unix))]
    pub fn is_daemon_running(&self) -> bool {
        self.socket_exists()
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref().map(str::trim),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

/// Some(None) for an explicit 0 (disabled), None when unset or unparsable
fn env_secs(name: &str) -> Option<Option<Duration>> {
    let secs = std::env::var(name).ok()?.trim().parse::<u64>().ok()?;
    Some((secs > 0).then(|| Duration::from_secs(secs)))
}
