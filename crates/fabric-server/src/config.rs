//! Configuration: the server's own settings and the sectioned config store
//! served by the admin API.

use std::path::Path;
use std::sync::Arc;

use fabric_transport::{DEFAULT_NAMESPACE, TransportConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::FabricError;

/// Section of the store the server reads its own settings from.
pub const SERVER_SECTION: &str = "server";

/// Server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Name used in logs
    pub name: String,
    /// Path prefix of the admin API
    pub admin_prefix: String,
    /// Connection namespace
    pub namespace: String,
    /// HTTP listener; `None` runs without one
    pub transport: Option<TransportConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "fabric".into(),
            admin_prefix: String::new(),
            namespace: DEFAULT_NAMESPACE.into(),
            transport: None,
        }
    }
}

impl ServerConfig {
    /// Read the `server` section, falling back to defaults when absent.
    pub fn from_store(store: &ConfigStore) -> Result<Self, FabricError> {
        match store.section(SERVER_SECTION) {
            Some(section) => serde_json::from_value(section)
                .map_err(|e| FabricError::Config(format!("invalid server section: {e}"))),
            None => Ok(Self::default()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConfigStore
// ─────────────────────────────────────────────────────────────────────────────

/// Called with the section name and its new value after every change.
pub type ChangeCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Thread-safe JSON configuration split into named sections.
#[derive(Clone, Default)]
pub struct ConfigStore {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    sections: RwLock<Map<String, Value>>,
    callbacks: RwLock<Vec<ChangeCallback>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object whose keys are section names.
    pub fn from_value(value: Value) -> Result<Self, FabricError> {
        let Value::Object(sections) = value else {
            return Err(FabricError::Config("configuration must be a JSON object".into()));
        };
        let store = Self::new();
        *store.inner.sections.write() = sections;
        Ok(store)
    }

    /// Load a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FabricError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| FabricError::Config(format!("{}: {e}", path.display())))?;
        let store = Self::from_value(value)?;
        info!("Loaded configuration from {}", path.display());
        Ok(store)
    }

    pub fn section(&self, name: &str) -> Option<Value> {
        self.inner.sections.read().get(name).cloned()
    }

    /// Every section as one object.
    pub fn sections(&self) -> Value {
        Value::Object(self.inner.sections.read().clone())
    }

    pub fn section_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.sections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Replace a whole section.
    pub fn set_section(&self, name: &str, value: Value) {
        self.inner
            .sections
            .write()
            .insert(name.to_string(), value.clone());
        self.notify(&[(name.to_string(), value)]);
    }

    /// Merge `{ "<section>": {...} }` into the store. Objects merge key by
    /// key, anything else replaces. Returns the sections that changed.
    pub fn update(&self, patch: Value) -> Result<Vec<String>, FabricError> {
        let Value::Object(patch) = patch else {
            return Err(FabricError::Config("update must be a JSON object".into()));
        };

        let changed: Vec<(String, Value)> = {
            let mut sections = self.inner.sections.write();
            patch
                .into_iter()
                .filter_map(|(name, value)| {
                    let slot = sections.entry(name.clone()).or_insert(Value::Null);
                    let before = slot.clone();
                    merge(slot, value);
                    (*slot != before).then(|| (name, slot.clone()))
                })
                .collect()
        };

        self.notify(&changed);
        Ok(changed.into_iter().map(|(name, _)| name).collect())
    }

    /// Register a change callback.
    pub fn on_change(&self, callback: impl Fn(&str, &Value) + Send + Sync + 'static) {
        self.inner.callbacks.write().push(Arc::new(callback));
    }

    fn notify(&self, changed: &[(String, Value)]) {
        if changed.is_empty() {
            return;
        }
        let callbacks = self.inner.callbacks.read().clone();
        for (name, value) in changed {
            debug!("Config section '{name}' changed");
            for callback in &callbacks {
                callback(name, value);
            }
        }
    }
}

fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(target.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch,
    }
}
