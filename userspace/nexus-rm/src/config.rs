// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Platform configuration loaded from TOML.
//!
//! Every field has a default, so an empty document yields [`RmConfig::default`].

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Offending file.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid TOML or has unknown keys.
    #[error("failed to parse config: {source}")]
    Parse {
        /// Underlying parser failure.
        #[source]
        source: toml::de::Error,
    },
    /// A value is outside its permitted domain.
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Tunables of a [`Platform`](crate::Platform).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RmConfig {
    /// Granularity of bindings and fault rounding.
    pub page_size: usize,
    /// Capacity of each capability space.
    pub cap_slots: usize,
    /// Lowest address managed by a region map.
    pub va_base: usize,
    /// Size of the window managed by a region map.
    pub va_size: usize,
    /// Base at which a domain image is attached.
    pub image_base: usize,
    /// Base at which the dynamic linker is attached.
    pub linker_base: usize,
}

impl Default for RmConfig {
    fn default() -> Self {
        Self {
            page_size: 0x1000,
            cap_slots: 1024,
            va_base: 0x1000,
            va_size: 0x7fff_ffff_f000,
            image_base: 0x0100_0000,
            linker_base: 0x3000_0000,
        }
    }
}

impl RmConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(data).map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&data)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid("page_size must be a power of two"));
        }
        if self.cap_slots == 0 || self.cap_slots > u32::MAX as usize {
            return Err(ConfigError::Invalid("cap_slots out of range"));
        }
        let mask = self.page_size - 1;
        if self.va_base & mask != 0 || self.va_size & mask != 0 || self.va_size == 0 {
            return Err(ConfigError::Invalid("address window must be page aligned and non-empty"));
        }
        if self.va_base.checked_add(self.va_size).is_none() {
            return Err(ConfigError::Invalid("address window overflows"));
        }
        if self.image_base & mask != 0 || self.linker_base & mask != 0 {
            return Err(ConfigError::Invalid("image and linker bases must be page aligned"));
        }
        Ok(())
    }
}
