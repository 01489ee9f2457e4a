//! Session state persisted across restarts.
//!
//! The controller records whether it was connected, under which instance id
//! and against which registry, so a restarted agent can decide whether to
//! restore the connection. Storage is a plain key-value collaborator behind
//! [`SessionStore`].

use crate::persistence;
use crate::{BeaconError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Keys written by the controller.
pub struct SessionKeys;

impl SessionKeys {
    pub const CONNECTED: &'static str = "connected";
    pub const INSTANCE_ID: &'static str = "instance_id";
    pub const SERVER_URL: &'static str = "server_url";
}

/// Key-value store for session flags.
pub trait SessionStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// Typed view over the session keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub connected: bool,
    pub instance_id: Option<String>,
    pub server_url: Option<String>,
}

impl SessionState {
    pub fn load(store: &dyn SessionStore) -> Self {
        let string = |key: &str| {
            store
                .get(key)
                .and_then(|v| v.as_str().map(str::to_string))
                .filter(|s| !s.is_empty())
        };
        Self {
            connected: store
                .get(SessionKeys::CONNECTED)
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            instance_id: string(SessionKeys::INSTANCE_ID),
            server_url: string(SessionKeys::SERVER_URL),
        }
    }

    pub fn save(&self, store: &dyn SessionStore) -> Result<()> {
        store.set(SessionKeys::CONNECTED, Value::Bool(self.connected))?;
        match &self.instance_id {
            Some(id) => store.set(SessionKeys::INSTANCE_ID, Value::String(id.clone()))?,
            None => store.remove(SessionKeys::INSTANCE_ID)?,
        }
        match &self.server_url {
            Some(url) => store.set(SessionKeys::SERVER_URL, Value::String(url.clone()))?,
            None => store.remove(SessionKeys::SERVER_URL)?,
        }
        Ok(())
    }

    pub fn clear(store: &dyn SessionStore) -> Result<()> {
        store.remove(SessionKeys::CONNECTED)?;
        store.remove(SessionKeys::INSTANCE_ID)?;
        store.remove(SessionKeys::SERVER_URL)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-process store, for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        lock(&self.values).insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object on disk.
///
/// The file is read once on open; every change rewrites it atomically. An
/// empty store removes the file.
#[derive(Debug)]
pub struct JsonSessionStore {
    path: PathBuf,
    values: Mutex<HashMap<String, Value>>,
}

impl JsonSessionStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = persistence::read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// Open the store at `<config dir>/beacon/session.json`.
    pub fn open_default() -> Result<Self> {
        let path = crate::config::AppConfig::default_session_path().ok_or_else(|| {
            BeaconError::Io {
                message: "No platform config directory for the session file".to_string(),
                source: None,
            }
        })?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, values: &HashMap<String, Value>) -> Result<()> {
        if values.is_empty() {
            persistence::remove_file(&self.path)
        } else {
            persistence::write_json(&self.path, values)
        }
    }
}

impl SessionStore for JsonSessionStore {
    fn get(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = lock(&self.values);
        if values.get(key) == Some(&value) {
            return Ok(());
        }
        values.insert(key.to_string(), value);
        debug!("Session key '{}' updated", key);
        self.flush(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = lock(&self.values);
        if values.remove(key).is_none() {
            return Ok(());
        }
        self.flush(&values)
    }
}
