//! TOML Configuration for the UE sync receiver
//!
//! Every section is optional; missing fields fall back to the library defaults.

use anyhow::{Context, Result};
use layers::phy::{DownlinkConfig, UeSyncConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UeAppConfig {
    /// Sync driver settings
    #[serde(default)]
    pub sync: UeSyncConfig,
    /// Sample source selection
    #[serde(default)]
    pub source: SourceConfig,
    /// Synthetic downlink used when no capture file is given
    #[serde(default)]
    pub synthetic: DownlinkConfig,
    /// Run limits and reporting
    #[serde(default)]
    pub run: RunConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl UeAppConfig {
    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing configuration {}", path.display()))
    }
}

/// Sample source configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// IQ capture to read; the synthetic downlink is used when absent
    #[serde(default)]
    pub input: Option<String>,
    /// Capture sample format (cf32 or ci16)
    #[serde(default = "default_format")]
    pub format: String,
    /// Restart the capture at end of file
    #[serde(default)]
    pub looping: bool,
}

fn default_format() -> String {
    "cf32".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            input: None,
            format: default_format(),
            looping: false,
        }
    }
}

/// Run limits and reporting
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Stop after this many subframes have been processed
    #[serde(default)]
    pub max_subframes: Option<u64>,
    /// Log statistics every this many delivered subframes
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

fn default_stats_interval() -> u64 {
    1000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_subframes: None,
            stats_interval: default_stats_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level used when neither RUST_LOG nor --log-level is set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
