//! Configuration loading and parsing
//!
//! The TOML layout mirrors the command line: an `[endpoint]` table with the
//! file paths, an optional `[bus]` table and an optional `[filtering]`
//! table. Anything omitted falls back to the same defaults the flags use.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use can_endpoint::{BusConfig, ManagerConfig};

/// Main application configuration (loaded from endpoint.toml)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub endpoint: EndpointSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub filtering: FilteringSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointSection {
    pub dbc_file: PathBuf,
    pub initial_values: PathBuf,
    pub save_values: Option<PathBuf>,
    /// Period for messages without a declared cycle time, in milliseconds
    #[serde(default = "default_period_ms")]
    pub default_period_ms: u64,
}

fn default_period_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusSection {
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            bitrate: default_bitrate(),
        }
    }
}

fn default_channel() -> String {
    "vcan0".to_string()
}

fn default_bitrate() -> u32 {
    500_000
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilteringSection {
    /// Receive only messages these nodes all transmit
    #[serde(default)]
    pub target_nodes: Vec<String>,
    #[serde(default)]
    pub record_last_frames: bool,
    #[serde(default)]
    pub log_frames: bool,
}

impl AppConfig {
    /// Convert the file representation into the library configuration.
    pub fn into_manager_config(self) -> ManagerConfig {
        let mut config = ManagerConfig::new(self.endpoint.dbc_file, self.endpoint.initial_values)
            .with_bus(BusConfig::new(self.bus.channel).with_bitrate(self.bus.bitrate))
            .with_default_period(Duration::from_millis(self.endpoint.default_period_ms))
            .with_recording(self.filtering.record_last_frames)
            .with_frame_logging(self.filtering.log_frames);

        if let Some(path) = self.endpoint.save_values {
            config = config.with_save_path(path);
        }
        for name in self.filtering.target_nodes {
            config = config.add_target_name(name);
        }

        config
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}
