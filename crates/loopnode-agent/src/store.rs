//! Persistent secret store
//!
//! Small named strings and integers the agent needs across restarts:
//! node identity and the IP-info cache. Backed by a single JSON file
//! under the state directory; tests use the in-memory variant.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing::warn;

/// Store key for the generated node id.
pub const KEY_NODE_ID: &str = "node_id";
/// Store key for the last observed public IP.
pub const KEY_CACHED_IP: &str = "cached_ip";
/// Store key for the cached geolocation JSON.
pub const KEY_CACHED_IP_INFO: &str = "cached_ip_info";
/// Store key for the last IP check, wall-clock ms.
pub const KEY_LAST_IP_CHECK: &str = "last_ip_check";

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("State file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Read/write access to small named values. Implementations must be
/// callable from any task.
pub trait SecretStore: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;
    fn put_string(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn get_i64(&self, key: &str) -> Option<i64>;
    fn put_i64(&self, key: &str, value: i64) -> Result<(), StoreError>;
}

/// JSON-file-backed store. The whole map is rewritten on every put;
/// values here are tiny and writes are rare.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl FileStore {
    /// Open (or create) the store under `dir`.
    pub fn open(dir: &std::path::Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|e| StoreError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let path = dir.join("state.json");
        let entries = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                source: e,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(StoreError::Io {
                    path: path.clone(),
                    source: e,
                })
            }
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Default location: `~/.loopnode`.
    pub fn open_default() -> Result<Self, StoreError> {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".loopnode");
        Self::open(&dir)
    }

    fn put(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), value);

        let json = serde_json::to_string_pretty(&*entries)?;
        fs::write(&self.path, json).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: e,
        })
    }
}

impl SecretStore for FileStore {
    fn get_string(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries.get(key)?.as_str().map(|s| s.to_string())
    }

    fn put_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put(key, serde_json::Value::from(value))
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        let entries = self.entries.lock().unwrap();
        entries.get(key)?.as_i64()
    }

    fn put_i64(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.put(key, serde_json::Value::from(value))
    }
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn get_string(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries.get(key)?.as_str().map(|s| s.to_string())
    }

    fn put_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), serde_json::Value::from(value));
        Ok(())
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        let entries = self.entries.lock().unwrap();
        entries.get(key)?.as_i64()
    }

    fn put_i64(&self, key: &str, value: i64) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), serde_json::Value::from(value));
        Ok(())
    }
}

/// Load the configured node id, or mint and persist one.
pub fn resolve_node_id(store: &dyn SecretStore) -> String {
    if let Some(id) = store.get_string(KEY_NODE_ID) {
        return id;
    }

    let id = uuid::Uuid::new_v4().to_string();
    if let Err(e) = store.put_string(KEY_NODE_ID, &id) {
        warn!(error = %e, "Failed to persist generated node id");
    }
    id
}
