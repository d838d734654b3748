//! Published state table.
//!
//! Everything the daemon exposes to operator dashboards lives in a
//! hierarchy of slash-separated paths: camera records, stream URLs,
//! control metadata, chooser state. Values are JSON and publishes are
//! retained, so a dashboard attaching late still sees the full record. A
//! small set of paths is writable from outside (chooser selections,
//! control values); backends collect those writes and the camera workers
//! drain them once per tick.

pub mod chooser;
pub mod mqtt;

pub use chooser::Chooser;
pub use mqtt::MqttBackend;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use serde_json::Value;

/// Transport for table traffic.
pub trait KvBackend: Send + Sync {
    /// Publishes `value` at `path`, retained.
    fn publish(&self, path: &str, value: &Value) -> Result<()>;

    /// Registers interest in external writes to `path`.
    fn watch(&self, path: &str) -> Result<()>;

    /// Drains external writes received since the last call.
    fn take_writes(&self) -> Result<Vec<(String, Value)>>;
}

/// Backend for tests and broker-less operation: publishes land in a map,
/// external writes are injected by hand.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<HashMap<String, Value>>,
    pending: Mutex<Vec<(String, Value)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value published at `path`.
    pub fn get(&self, path: &str) -> Option<Value> {
        self.state.lock().ok()?.get(path).cloned()
    }

    /// Queues a write as if a dashboard had sent it.
    pub fn inject_write(&self, path: &str, value: Value) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push((path.to_string(), value));
        }
    }
}

impl KvBackend for MemoryBackend {
    fn publish(&self, path: &str, value: &Value) -> Result<()> {
        self.state
            .lock()
            .map_err(|_| anyhow!("table state lock poisoned"))?
            .insert(path.to_string(), value.clone());
        Ok(())
    }

    fn watch(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn take_writes(&self) -> Result<Vec<(String, Value)>> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| anyhow!("table write queue lock poisoned"))?;
        Ok(std::mem::take(&mut *pending))
    }
}

/// A position in the hierarchy. Cheap to clone; all clones share one
/// backend connection.
#[derive(Clone)]
pub struct Table {
    backend: Arc<dyn KvBackend>,
    prefix: String,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("prefix", &self.prefix).finish()
    }
}

impl Table {
    pub fn root(backend: Arc<dyn KvBackend>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            backend,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub fn child(&self, name: &str) -> Table {
        Table {
            backend: Arc::clone(&self.backend),
            prefix: self.key(name),
        }
    }

    pub fn path(&self) -> &str {
        &self.prefix
    }

    /// Full path of an entry under this table.
    pub fn key(&self, name: &str) -> String {
        let name = name.trim_matches('/');
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.prefix)
        }
    }

    pub fn put(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.backend.publish(&self.key(name), &value.into())
    }

    pub fn watch(&self, name: &str) -> Result<()> {
        self.backend.watch(&self.key(name))
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }
}
