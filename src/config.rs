//! Pack configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/pack.toml` (base configuration)
//! 2. Environment variables prefixed with `BQ_PACK_`, `__` separating levels
//!    (e.g. `BQ_PACK_PACK__DEVICES_USED=3`)
//!
//! Every field has a default, so a missing file yields the stock four-chip pack.
//!
//! # Example
//! ```no_run
//! use bq76pl536_daq::config::PackConfig;
//!
//! let config = PackConfig::load()?;
//! config.validate()?;
//! println!("{} chips", config.pack.devices_used);
//! # Ok::<(), bq76pl536_daq::BqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::chain::topology::CellCountTable;
use crate::error::{BqError, Result};
use crate::protocol::registers::{addr, encode_delay_ms, encode_overvoltage, encode_undervoltage};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/pack.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BQ_PACK_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Chain layout
    pub pack: PackLayoutConfig,
    /// Protection thresholds programmed at attach
    pub protection: ProtectionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Expected chain layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackLayoutConfig {
    /// Chips expected on the chain
    pub devices_used: u8,
    /// Expected populated cells per chip, first chip first
    pub cells_per_device: Vec<u8>,
}

/// Protection set points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Cell over-voltage threshold in millivolts
    pub overvoltage_mv: u16,
    /// Cell under-voltage threshold in millivolts
    pub undervoltage_mv: u16,
    /// Over-voltage filter delay in milliseconds
    pub overvoltage_delay_ms: u16,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "bq-pack".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for PackLayoutConfig {
    fn default() -> Self {
        Self {
            devices_used: 4,
            cells_per_device: vec![4, 4, 4, 3],
        }
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            overvoltage_mv: 3500,
            undervoltage_mv: 3000,
            overvoltage_delay_ms: 100,
        }
    }
}

impl PackConfig {
    /// Load configuration from `config/pack.toml` and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// Provider stack: defaults, then the TOML file, then the environment.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(PackConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(BqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let devices = self.pack.devices_used;
        if devices == 0 || devices > addr::MAX_CHIPS {
            return Err(BqError::Configuration(format!(
                "Invalid devices_used {devices}. Must be 1-{}",
                addr::MAX_CHIPS
            )));
        }

        if self.pack.cells_per_device.len() < devices as usize {
            return Err(BqError::Configuration(format!(
                "cells_per_device lists {} chips but devices_used is {devices}",
                self.pack.cells_per_device.len()
            )));
        }

        for (i, cells) in self.pack.cells_per_device[..devices as usize].iter().enumerate() {
            if !(3..=6).contains(cells) {
                return Err(BqError::Configuration(format!(
                    "Chip {} expects {cells} cells. Must be 3-6",
                    i + 1
                )));
            }
        }

        encode_overvoltage(self.protection.overvoltage_mv)?;
        encode_undervoltage(self.protection.undervoltage_mv)?;
        encode_delay_ms(self.protection.overvoltage_delay_ms)?;

        if self.protection.undervoltage_mv >= self.protection.overvoltage_mv {
            return Err(BqError::Configuration(format!(
                "undervoltage_mv {} must be below overvoltage_mv {}",
                self.protection.undervoltage_mv, self.protection.overvoltage_mv
            )));
        }

        Ok(())
    }

    /// Expected cell counts for the chips in use, index 0 unused.
    pub fn cell_count_table(&self) -> Result<CellCountTable> {
        let used = (self.pack.devices_used as usize).min(self.pack.cells_per_device.len());
        CellCountTable::from_counts(&self.pack.cells_per_device[..used])
    }
}
