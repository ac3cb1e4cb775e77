//! Device limits and engine options
//!
//! `DeviceConfig` describes the accelerator the plan is built for: how many
//! compute units exist, how large each unit's staging buffer is, and the
//! vector and transfer granularity. `EngineConfig` adds execution options.
//!
//! Both load from JSON and validate before use.

use serde::{Deserialize, Serialize};

use crate::error::{ConcatError, Result};

/// Number of staging slots cycled per worker
pub const STAGING_SLOTS: usize = 2;

/// Hardware limits consumed by the planner and the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Independent compute units available to one launch
    pub core_count: usize,
    /// On-chip staging memory per compute unit, in bytes
    pub staging_bytes: usize,
    /// Width of one vector register, in bytes
    pub vector_bytes: usize,
    /// Minimum transfer granularity, in bytes
    pub block_bytes: usize,
    /// Staging bytes set aside for index vectors
    pub index_reserve_bytes: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            core_count: 48,
            staging_bytes: 192 * 1024,
            vector_bytes: 256,
            block_bytes: 32,
            index_reserve_bytes: 1024,
        }
    }
}

impl DeviceConfig {
    /// Small device for tests: few cores and a tiny staging buffer, so that
    /// modest inputs already need many tiles
    #[must_use]
    pub fn small() -> Self {
        Self {
            core_count: 4,
            staging_bytes: 8 * 1024,
            vector_bytes: 64,
            block_bytes: 32,
            index_reserve_bytes: 256,
        }
    }

    /// Set compute unit count
    #[must_use]
    pub fn with_core_count(mut self, core_count: usize) -> Self {
        self.core_count = core_count;
        self
    }

    /// Set staging buffer size
    #[must_use]
    pub fn with_staging_bytes(mut self, staging_bytes: usize) -> Self {
        self.staging_bytes = staging_bytes;
        self
    }

    /// Set vector register width
    #[must_use]
    pub fn with_vector_bytes(mut self, vector_bytes: usize) -> Self {
        self.vector_bytes = vector_bytes;
        self
    }

    /// Set transfer granularity
    #[must_use]
    pub fn with_block_bytes(mut self, block_bytes: usize) -> Self {
        self.block_bytes = block_bytes;
        self
    }

    /// Bytes available to one staging slot (input or output half)
    #[must_use]
    pub fn slot_bytes(&self) -> usize {
        (self.staging_bytes / STAGING_SLOTS).saturating_sub(self.index_reserve_bytes) / 2
    }

    /// Validate the limits
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if any limit is zero or inconsistent
    pub fn validate(&self) -> Result<()> {
        if self.core_count == 0 {
            return Err(ConcatError::InvalidConfiguration(
                "core_count must be > 0".to_string(),
            ));
        }
        if !self.block_bytes.is_power_of_two() || self.block_bytes < 8 {
            return Err(ConcatError::InvalidConfiguration(format!(
                "block_bytes must be a power of two >= 8, got {}",
                self.block_bytes
            )));
        }
        if self.vector_bytes == 0 || self.vector_bytes % self.block_bytes != 0 {
            return Err(ConcatError::InvalidConfiguration(format!(
                "vector_bytes {} must be a non-zero multiple of block_bytes {}",
                self.vector_bytes, self.block_bytes
            )));
        }
        if self.slot_bytes() < self.block_bytes {
            return Err(ConcatError::InvalidConfiguration(format!(
                "staging_bytes {} leaves no room for one block per slot after reserving {}",
                self.staging_bytes, self.index_reserve_bytes
            )));
        }
        Ok(())
    }
}

/// Engine execution options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Device the plan targets
    pub device: DeviceConfig,
    /// Run stage-in, repack and stage-out on separate threads per worker
    pub overlap_transfers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            overlap_transfers: true,
        }
    }
}

impl EngineConfig {
    /// Create config for a device
    #[must_use]
    pub fn new(device: DeviceConfig) -> Self {
        Self {
            device,
            ..Self::default()
        }
    }

    /// Single-threaded pipeline (slots still alternate by parity)
    #[must_use]
    pub fn sequential() -> Self {
        Self {
            overlap_transfers: false,
            ..Self::default()
        }
    }

    /// Set device limits
    #[must_use]
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    /// Enable or disable overlapped transfers
    #[must_use]
    pub fn with_overlap_transfers(mut self, overlap: bool) -> Self {
        self.overlap_transfers = overlap;
        self
    }

    /// Parse and validate a JSON config
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigParse` on malformed JSON, or `InvalidConfiguration`
    /// if the parsed limits are unusable
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if the device limits are unusable
    pub fn validate(&self) -> Result<()> {
        self.device.validate()
    }
}
