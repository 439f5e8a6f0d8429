// Persistence for the durable pair (desired_connected, channel_id)
// Stored in $STATE_DIR/listen_state.json; writes take an exclusive file lock
// and land atomically so a reader never sees a half-written file

use crate::session::config::Config;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const DESIRED_CONNECTED_KEY: &str = "desired_connected";
pub const CHANNEL_ID_KEY: &str = "channel_id";

/// A value in the durable key-value store
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Bool(bool),
    Text(String),
}

/// Durable key-value store. Only the supervisor writes to it; anyone may read.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StoredValue>>;

    fn put(&self, key: &str, value: StoredValue) -> Result<()>;

    /// Write several keys together. Implementations that can make the batch
    /// atomic should override this.
    fn put_all(&self, entries: &[(&str, StoredValue)]) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value.clone())?;
        }
        Ok(())
    }
}

/// The durable pair, the single source of truth across restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ListenState {
    pub desired_connected: bool,
    pub channel_id: String,
}

impl ListenState {
    pub fn new(desired_connected: bool, channel_id: impl Into<String>) -> Self {
        Self {
            desired_connected,
            channel_id: channel_id.into(),
        }
    }

    /// Read the pair; missing or mistyped keys read as (false, "")
    pub fn load(store: &dyn DurableStore) -> Result<Self> {
        let desired_connected = match store.get(DESIRED_CONNECTED_KEY)? {
            Some(StoredValue::Bool(b)) => b,
            _ => false,
        };
        let channel_id = match store.get(CHANNEL_ID_KEY)? {
            Some(StoredValue::Text(s)) => s,
            _ => String::new(),
        };
        Ok(Self {
            desired_connected,
            channel_id,
        })
    }

    pub fn save(&self, store: &dyn DurableStore) -> Result<()> {
        store.put_all(&[
            (
                DESIRED_CONNECTED_KEY,
                StoredValue::Bool(self.desired_connected),
            ),
            (CHANNEL_ID_KEY, StoredValue::Text(self.channel_id.clone())),
        ])
    }
}

type Entries = BTreeMap<String, StoredValue>;

/// JSON file backed store. Every read goes to disk so other processes see the
/// daemon's latest write.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.state_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn read_entries(&self) -> Result<Entries> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Entries::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read state file: {}", self.path.display())
                })
            }
        };

        if contents.trim().is_empty() {
            return Ok(Entries::new());
        }

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))
    }

    fn update(&self, apply: impl FnOnce(&mut Entries)) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create state directory: {}", parent.display())
            })?;
        }

        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())
            .with_context(|| "Failed to open state lock file")?;
        lock_file
            .lock_exclusive()
            .with_context(|| "Failed to acquire exclusive lock on state file")?;

        let mut entries = self.read_entries()?;
        apply(&mut entries);
        let contents =
            serde_json::to_string_pretty(&entries).with_context(|| "Failed to serialize state")?;
        atomic_write(&self.path, &contents)

        // Lock is released when lock_file is dropped
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        Ok(self.read_entries()?.remove(key))
    }

    fn put(&self, key: &str, value: StoredValue) -> Result<()> {
        self.update(|entries| {
            entries.insert(key.to_string(), value);
        })
    }

    fn put_all(&self, batch: &[(&str, StoredValue)]) -> Result<()> {
        self.update(|entries| {
            for (key, value) in batch {
                entries.insert(key.to_string(), value.clone());
            }
        })
    }
}

/// In-memory store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: &ListenState) -> Self {
        let store = Self::new();
        // MemoryStore::put cannot fail
        let _ = state.save(&store);
        store
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: StoredValue) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// Atomically save data to a file using write-to-temp + rename
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Invalid path: {}", path.display()))?;

    // Temp file in the same directory so the rename stays on one filesystem
    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown"),
        std::process::id()
    ));

    fs::write(&temp_path, contents)
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
