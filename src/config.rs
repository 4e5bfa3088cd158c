//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/typhos.toml` by default)
//! 2. environment variables prefixed with `TYPHOS_`, nested keys separated
//!    by a double underscore
//!
//! # Example
//! ```no_run
//! use typhos::config::TyphosConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TyphosConfig::load()?;
//! config.validate()?;
//! println!("Kind level: {}", config.alarm.kind_level);
//! # Ok(())
//! # }
//! ```
//!
//! Override the tier without touching the file:
//! `TYPHOS_ALARM__KIND_LEVEL=config`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::alarm::indicator::ShapeKind;
use crate::alarm::level::KindLevel;
use crate::device::StaticDevice;
use crate::error::{AppResult, TyphosError};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/typhos.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TyphosConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Alarm summary settings
    #[serde(default)]
    pub alarm: AlarmConfig,
    /// Local device catalog
    #[serde(default)]
    pub devices: Vec<StaticDevice>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Typhos".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Alarm summary configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlarmConfig {
    /// Which signals take part in the summary
    #[serde(default)]
    pub kind_level: KindLevel,
    /// Indicator outline
    #[serde(default)]
    pub shape: ShapeKind,
}

impl TyphosConfig {
    /// Load from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and the environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::from(Serialized::defaults(TyphosConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TYPHOS_").split("__"))
            .extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(TyphosError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if let ShapeKind::Polygon { sides } = self.alarm.shape {
            if sides < 3 {
                return Err(TyphosError::Configuration(format!(
                    "Polygon indicator needs at least 3 sides, got {}",
                    sides
                )));
            }
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.as_str()) {
                return Err(TyphosError::Configuration(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }
        }

        Ok(())
    }

    /// Look up a catalog device by name
    pub fn device(&self, name: &str) -> Option<&StaticDevice> {
        self.devices.iter().find(|device| device.name == name)
    }

    /// Catalog devices for `names`, or every device when `names` is empty.
    ///
    /// Returns the devices found and the names that are not in the catalog.
    pub fn select_devices(&self, names: &[String]) -> (Vec<StaticDevice>, Vec<String>) {
        if names.is_empty() {
            return (self.devices.clone(), Vec::new());
        }
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for name in names {
            match self.device(name) {
                Some(device) => found.push(device.clone()),
                None => missing.push(name.clone()),
            }
        }
        (found, missing)
    }
}
