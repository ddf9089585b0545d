// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Static parameters of a backend instance.

use crate::spec::grant::XEN_PAGE_MASK;
use crate::spec::mmio;
use crate::spec::VIRTIO_QUEUE_SIZE_LIMIT;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Default size of the trapped register window.
pub const DEFAULT_MMIO_SIZE: u64 = 0x200;

/// Largest register window. Register offsets are 16 bits wide.
pub const MAX_MMIO_SIZE: u64 = 0x1_0000;

/// Default store directory holding frontend descriptions.
pub const DEFAULT_STORE_ROOT: &str = "backend/virtio";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one queue is required")]
    NoQueues,
    #[error("max queue depth {0} must be a non-zero power of two no larger than 32768")]
    InvalidQueueDepth(u16),
    #[error("base address {0:#x} is not page aligned")]
    UnalignedBase(u64),
    #[error("mmio window of {window:#x} bytes cannot hold {config_len} bytes of device config")]
    WindowTooSmall { window: u64, config_len: usize },
    #[error("mmio window of {0:#x} bytes exceeds {MAX_MMIO_SIZE:#x} bytes")]
    WindowTooLarge(u64),
}

/// A shared memory region advertised through the SHM registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ShmRegion {
    pub base: u64,
    pub len: u64,
}

/// Bring-up retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub base_delay_ms: u64,
    /// The delay doubles per consecutive failure up to
    /// `base_delay_ms << max_backoff_shift`.
    pub max_backoff_shift: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_backoff_shift: 5,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Configuration of one virtio-mmio backend.
#[derive(Debug, Clone, Deserialize)]
pub struct XenVirtioConfig {
    pub device_id: u32,
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u32,
    /// Device specific feature bits. The transport bits are added on top.
    #[serde(default)]
    pub device_features: u64,
    pub queue_count: u16,
    pub max_queue_depth: u16,
    #[serde(default)]
    pub config_space: Vec<u8>,
    /// Guest physical base of the register window, as recorded by the
    /// frontend in the store.
    pub base_address: u64,
    #[serde(default = "default_mmio_size")]
    pub mmio_size: u64,
    #[serde(default)]
    pub shm_regions: Vec<ShmRegion>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_store_root")]
    pub store_root: String,
}

fn default_vendor_id() -> u32 {
    u32::from_le_bytes(*b"XENV")
}

fn default_mmio_size() -> u64 {
    DEFAULT_MMIO_SIZE
}

fn default_store_root() -> String {
    DEFAULT_STORE_ROOT.to_owned()
}

impl XenVirtioConfig {
    pub fn new(device_id: u32, queue_count: u16, max_queue_depth: u16, base_address: u64) -> Self {
        Self {
            device_id,
            vendor_id: default_vendor_id(),
            device_features: 0,
            queue_count,
            max_queue_depth,
            config_space: Vec::new(),
            base_address,
            mmio_size: DEFAULT_MMIO_SIZE,
            shm_regions: Vec::new(),
            retry: RetryConfig::default(),
            store_root: default_store_root(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_count == 0 {
            return Err(ConfigError::NoQueues);
        }
        if !self.max_queue_depth.is_power_of_two() || self.max_queue_depth > VIRTIO_QUEUE_SIZE_LIMIT
        {
            return Err(ConfigError::InvalidQueueDepth(self.max_queue_depth));
        }
        if self.base_address & XEN_PAGE_MASK != 0 {
            return Err(ConfigError::UnalignedBase(self.base_address));
        }
        if self.mmio_size > MAX_MMIO_SIZE {
            return Err(ConfigError::WindowTooLarge(self.mmio_size));
        }
        if self.mmio_size < mmio::CONFIG as u64 + self.config_space.len() as u64 {
            return Err(ConfigError::WindowTooSmall {
                window: self.mmio_size,
                config_len: self.config_space.len(),
            });
        }
        Ok(())
    }
}
