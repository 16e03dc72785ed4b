//! Vault configuration.
//!
//! Describes the hardware the vault drives: how many temporary key slots
//! the device exposes, where they start in its object id space, how large
//! one data chunk may be, and which provisioned object holds the PSK.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Hardware layout and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Number of temporary key slots in the pool.
    pub slot_capacity: u16,
    /// Device object id of pool index 0.
    pub slot_base: u16,
    /// Maximum bytes per cipher/MAC update command.
    pub chunk_size: usize,
    /// Provisioned object id holding the pre-shared key.
    pub default_psk_object: u16,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            slot_capacity: 16,
            slot_base: 0,
            chunk_size: 2032,
            default_psk_object: 0x1234,
        }
    }
}

impl VaultConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check the pool fits the 16-bit object space and does not overlap
    /// the provisioned PSK object.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_capacity == 0 || self.slot_capacity > 256 {
            return Err(ConfigError::Invalid(format!(
                "slot_capacity {} outside 1..=256",
                self.slot_capacity
            )));
        }
        let end = u32::from(self.slot_base) + u32::from(self.slot_capacity);
        if end > u32::from(u16::MAX) + 1 {
            return Err(ConfigError::Invalid("slot range exceeds object id space".into()));
        }
        let psk = u32::from(self.default_psk_object);
        if psk >= u32::from(self.slot_base) && psk < end {
            return Err(ConfigError::Invalid(format!(
                "psk object 0x{:04X} lies inside the slot pool",
                self.default_psk_object
            )));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be non-zero".into()));
        }
        // Each chunk travels behind a u16 length prefix.
        if self.chunk_size > usize::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} exceeds {}",
                self.chunk_size,
                u16::MAX
            )));
        }
        Ok(())
    }
}
