//! Application configuration, stored as TOML
//!
//! Looked up at `$PADBRIDGE_CONFIG` or `<config dir>/padbridge/config.toml`.
//! A default file is written on first start.

use crate::controller::event_processor::ZoneThresholds;
use crate::mqtt::broker::default_broker_config;
use crate::mqtt::config::{BrokerEndpoint, ReconnectPolicy};
use crate::persistence::mapping_store::JsonMappingStore;
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, Level};

const CONFIG_ENV: &str = "PADBRIDGE_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct LocalConfig {
    pub host: String,
    pub port: u16,
    /// Address announced to devices instead of the detected one
    #[serde(default)]
    pub advertise_ip: Option<String>,
    /// Client id announced to devices in the discovery response
    pub announced_client_id: String,
    /// Our own MQTT client id on the local bus
    pub session_client_id: String,
    pub base_topic: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            advertise_ip: None,
            announced_client_id: "game_controller_client".to_string(),
            session_client_id: "padbridge-local".to_string(),
            base_topic: "gamecontroller".to_string(),
        }
    }
}

impl LocalConfig {
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint::new(self.host.clone(), self.port, self.session_client_id.clone())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BrokerConfig {
    pub executable: String,
    pub config_path: PathBuf,
    pub probe_timeout_ms: u64,
    pub start_timeout_secs: u64,
    pub startup_grace_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            executable: "mosquitto".to_string(),
            config_path: default_broker_config(),
            probe_timeout_ms: 1000,
            start_timeout_secs: 5,
            startup_grace_ms: 2000,
        }
    }
}

impl BrokerConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct InputConfig {
    pub low_threshold: u16,
    pub high_threshold: u16,
    /// Log key events instead of injecting them
    pub dry_run: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        let thresholds = ZoneThresholds::default();
        Self {
            low_threshold: thresholds.low,
            high_threshold: thresholds.high,
            dry_run: false,
        }
    }
}

impl InputConfig {
    pub fn thresholds(&self) -> ZoneThresholds {
        ZoneThresholds {
            low: self.low_threshold,
            high: self.high_threshold,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub central: BrokerEndpoint,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default = "JsonMappingStore::default_dir")]
    pub mappings_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            central: BrokerEndpoint::new("central.example.org", 1883, "padbridge-central"),
            local: LocalConfig::default(),
            broker: BrokerConfig::default(),
            reconnect: ReconnectPolicy::default(),
            input: InputConfig::default(),
            mappings_dir: JsonMappingStore::default_dir(),
            log_level: default_log_level(),
        }
    }
}

impl AppConfig {
    pub fn path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("padbridge");
        path.push("config.toml");
        path
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| eyre!("Failed to read config {}: {}", path.display(), e))?;
        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config {}: {}", path.display(), e))?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        fs::write(path, content).map_err(|e| eyre!("Failed to write config: {}", e))?;
        Ok(())
    }

    /// Writes the default configuration if nothing exists at `path` yet.
    pub fn ensure_default_config(path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        info!("Creating default configuration at {}", path.display());
        AppConfig::default().save_to(path)
    }

    pub fn validate(&self) -> Result<()> {
        let input = &self.input;
        if input.low_threshold >= input.high_threshold {
            return Err(eyre!(
                "input.low_threshold ({}) must be below input.high_threshold ({})",
                input.low_threshold,
                input.high_threshold
            ));
        }
        if self.reconnect.min_delay_secs > self.reconnect.max_delay_secs {
            return Err(eyre!("reconnect.min_delay_secs exceeds reconnect.max_delay_secs"));
        }
        self.log_level()?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<Level> {
        self.log_level
            .parse::<Level>()
            .map_err(|_| eyre!("Unknown log level '{}'", self.log_level))
    }
}
