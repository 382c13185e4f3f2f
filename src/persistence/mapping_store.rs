//! Key-mapping storage
//!
//! One JSON file per controller plus a shared defaults file:
//!
//! ```text
//! <mappings_dir>/
//! ├── default_mappings.json   {"name": ..., "key_mappings": {...}}
//! ├── controller_1.json       {"id": "1", "name": ..., "key_mappings": {...}}
//! └── controller_2.json
//! ```
//!
//! Loading never fails. A missing or unreadable file falls back to the
//! defaults so a controller is always usable.

use crate::controller::controller::default_key_mappings;
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DEFAULTS_FILE: &str = "default_mappings.json";
const DEFAULTS_NAME: &str = "Default Controller Mapping";

/// Load/save interface for per-controller key mappings
pub trait MappingStore: Send + Sync {
    /// Mapping for a controller, or the defaults when nothing usable is stored
    fn load(&self, controller_id: &str) -> HashMap<String, String>;

    fn load_defaults(&self) -> HashMap<String, String>;

    fn save(
        &self,
        controller_id: &str,
        name: &str,
        key_mappings: &HashMap<String, String>,
    ) -> Result<()>;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct ControllerMappingFile {
    id: String,
    name: String,
    key_mappings: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct DefaultMappingFile {
    name: String,
    key_mappings: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct JsonMappingStore {
    dir: PathBuf,
}

impl JsonMappingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<config dir>/padbridge/mappings`
    pub fn default_dir() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("No config directory found, using current directory");
            PathBuf::from(".")
        });
        path.push("padbridge");
        path.push("mappings");
        path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn controller_path(&self, controller_id: &str) -> PathBuf {
        self.dir.join(format!("controller_{}.json", controller_id))
    }

    fn defaults_path(&self) -> PathBuf {
        self.dir.join(DEFAULTS_FILE)
    }

    /// Creates the mappings directory and the defaults file if they are missing.
    pub fn ensure_defaults(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| eyre!("Failed to create mappings directory: {}", e))?;

        let path = self.defaults_path();
        if path.exists() {
            return Ok(());
        }

        info!("Creating default mapping file at {}", path.display());
        let file = DefaultMappingFile {
            name: DEFAULTS_NAME.to_string(),
            key_mappings: default_key_mappings(),
        };
        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| eyre!("Failed to serialize default mappings: {}", e))?;
        fs::write(&path, content).map_err(|e| eyre!("Failed to write default mappings: {}", e))?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
        let parsed = serde_json::from_str(&content)
            .map_err(|e| eyre!("Failed to parse {}: {}", path.display(), e))?;
        Ok(Some(parsed))
    }
}

impl MappingStore for JsonMappingStore {
    fn load(&self, controller_id: &str) -> HashMap<String, String> {
        match Self::read_json::<ControllerMappingFile>(&self.controller_path(controller_id)) {
            Ok(Some(file)) => {
                debug!("Loaded mappings for controller {}", controller_id);
                file.key_mappings
            }
            Ok(None) => {
                debug!(
                    "No stored mappings for controller {}, using defaults",
                    controller_id
                );
                self.load_defaults()
            }
            Err(e) => {
                warn!("{}; using defaults for controller {}", e, controller_id);
                self.load_defaults()
            }
        }
    }

    fn load_defaults(&self) -> HashMap<String, String> {
        match Self::read_json::<DefaultMappingFile>(&self.defaults_path()) {
            Ok(Some(file)) => file.key_mappings,
            Ok(None) => default_key_mappings(),
            Err(e) => {
                warn!("{}; using built-in defaults", e);
                default_key_mappings()
            }
        }
    }

    fn save(
        &self,
        controller_id: &str,
        name: &str,
        key_mappings: &HashMap<String, String>,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| eyre!("Failed to create mappings directory: {}", e))?;

        let file = ControllerMappingFile {
            id: controller_id.to_string(),
            name: name.to_string(),
            key_mappings: key_mappings.clone(),
        };
        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| eyre!("Failed to serialize mappings: {}", e))?;

        let path = self.controller_path(controller_id);
        fs::write(&path, content)
            .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
        info!("Saved mappings for controller {} to {}", controller_id, path.display());
        Ok(())
    }
}

/// In-memory store for tests
#[cfg(test)]
#[derive(Default)]
pub struct MemoryMappingStore {
    pub stored: std::sync::Mutex<HashMap<String, HashMap<String, String>>>,
    pub saves: std::sync::Mutex<Vec<(String, String)>>,
    pub should_fail: bool,
}

#[cfg(test)]
impl MappingStore for MemoryMappingStore {
    fn load(&self, controller_id: &str) -> HashMap<String, String> {
        self.stored
            .lock()
            .unwrap()
            .get(controller_id)
            .cloned()
            .unwrap_or_else(default_key_mappings)
    }

    fn load_defaults(&self) -> HashMap<String, String> {
        default_key_mappings()
    }

    fn save(
        &self,
        controller_id: &str,
        name: &str,
        key_mappings: &HashMap<String, String>,
    ) -> Result<()> {
        if self.should_fail {
            return Err(eyre!("mock save failure"));
        }
        self.stored
            .lock()
            .unwrap()
            .insert(controller_id.to_string(), key_mappings.clone());
        self.saves
            .lock()
            .unwrap()
            .push((controller_id.to_string(), name.to_string()));
        Ok(())
    }
}
