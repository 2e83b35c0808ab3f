//! Key/value storage for the session token and user profile.
//!
//! The store outlives any single provider: a `FileStore` survives process
//! restarts, and several providers may share one store (last writer wins).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ApiError, Result};

pub const TOKEN_KEY: &str = "jwt";
pub const USER_KEY: &str = "user";

pub trait SessionStore: Send + Sync {
    /// Returns None if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(|e| ApiError::Store(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|e| ApiError::Store(e.to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|e| ApiError::Store(e.to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

/// Store persisted as a flat JSON object in a file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    fn load(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| ApiError::Store(e.to_string()))?;
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ApiError::Store(format!(
                "{} does not hold a JSON object",
                self.path.display()
            ))),
            Err(e) => Err(ApiError::Store(e.to_string())),
        }
    }

    fn save(&self, entries: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ApiError::Store(e.to_string()))?;
            }
        }
        let raw = serde_json::to_string_pretty(entries)
            .map_err(|e| ApiError::Store(e.to_string()))?;
        fs::write(&self.path, raw).map_err(|e| ApiError::Store(e.to_string()))?;
        debug!(path = %self.path.display(), "session store saved");
        Ok(())
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.read().map_err(|e| ApiError::Store(e.to_string()))?;
        Ok(self
            .load()?
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.write().map_err(|e| ApiError::Store(e.to_string()))?;
        let mut entries = self.load()?;
        entries.insert(key.to_string(), Value::String(value.to_string()));
        self.save(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.write().map_err(|e| ApiError::Store(e.to_string()))?;
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }
}
