//! Layered TOML configuration: a root file with the defaults plus an
//! optional overlay whose keys win. Tables merge recursively, everything
//! else is replaced.

use std::fs;
use std::path::Path;

use miette::{miette, IntoDiagnostic, Result, WrapErr};
use serde::Deserialize;
use toml::Table;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub vision_addr: String,
    pub vision_port: u16,
    pub referee_addr: String,
    pub referee_port: u16,
    /// Where encoded status messages are published.
    pub status_addr: String,
    /// Where radio command batches go (simulator or radio bridge).
    pub radio_addr: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            vision_addr: wire::VISION_MULTICAST_ADDR.to_string(),
            vision_port: wire::VISION_DEFAULT_PORT,
            referee_addr: wire::REFEREE_MULTICAST_ADDR.to_string(),
            referee_port: wire::REFEREE_DEFAULT_PORT,
            status_addr: "127.0.0.1:10055".to_string(),
            radio_addr: "127.0.0.1:10301".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Assumed delay between the field and processing, nanoseconds.
    pub system_delay_ns: i64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            system_delay_ns: 30_000_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Proportional gain on the position error, 1/s.
    pub position_gain: f32,
    /// Proportional gain on the velocity error.
    pub velocity_gain: f32,
    /// Proportional gain on the heading error, 1/s.
    pub heading_gain: f32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            position_gain: 2.5,
            velocity_gain: 0.8,
            heading_gain: 4.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub tracking: TrackingConfig,
    pub controller: ControllerConfig,
}

impl Config {
    /// Loads the root config and merges the overlay on top. Either file may
    /// be missing; missing keys fall back to the defaults.
    pub fn load(path: &Path, overlay_path: Option<&Path>) -> Result<Self> {
        let mut table = read_table(path)?;
        if let Some(overlay_path) = overlay_path {
            let overlay = read_table(overlay_path)?;
            table = merge_tables(table, overlay);
        }
        toml::Value::Table(table)
            .try_into()
            .map_err(|error| miette!("invalid configuration: {error}"))
    }
}

fn read_table(path: &Path) -> Result<Table> {
    if !path.exists() {
        return Ok(Table::new());
    }
    let text = fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    toml::from_str(&text)
        .into_diagnostic()
        .wrap_err_with(|| format!("parsing {}", path.display()))
}

/// Overlay keys win; tables merge recursively.
fn merge_tables(main: Table, overlay: Table) -> Table {
    let mut merged = Table::new();

    for (key, value) in main {
        match overlay.get(&key) {
            Some(toml::Value::Table(overlay_table)) => {
                if let toml::Value::Table(main_table) = value {
                    merged.insert(
                        key,
                        toml::Value::Table(merge_tables(main_table, overlay_table.clone())),
                    );
                } else {
                    merged.insert(key, toml::Value::Table(overlay_table.clone()));
                }
            }
            Some(overlay_value) => {
                merged.insert(key, overlay_value.clone());
            }
            None => {
                merged.insert(key, value);
            }
        }
    }
    for (key, value) in overlay {
        merged.entry(key).or_insert(value);
    }
    merged
}
