//! Registry configuration types
//!
//! The registry has no persisted state; this is the whole of its configuration.
//! It is read once when the bridge is constructed.

use crate::types::{BridgeError, Result};
use serde::{Deserialize, Serialize};

/// Slot limit observed on the reference slot provider
pub const DEFAULT_SLOT_LIMIT: usize = 2000;

/// Configuration for the bridge and its in-process slot pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Maximum number of native slots the pool can hand out
    #[serde(default = "default_slot_limit")]
    pub slot_limit: usize,

    /// Whether released slots go back to the pool. Some platforms can never
    /// reclaim a slot; released slots then stay consumed.
    #[serde(default = "default_reclaim_slots")]
    pub reclaim_slots: bool,

    /// First address handed out by the simulated pool
    #[serde(default = "default_address_base")]
    pub address_base: usize,

    /// Distance between two consecutive simulated addresses
    #[serde(default = "default_address_stride")]
    pub address_stride: usize,
}

fn default_slot_limit() -> usize {
    DEFAULT_SLOT_LIMIT
}

fn default_reclaim_slots() -> bool {
    !cfg!(windows)
}

fn default_address_base() -> usize {
    0x1000
}

fn default_address_stride() -> usize {
    16
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            slot_limit: default_slot_limit(),
            reclaim_slots: default_reclaim_slots(),
            address_base: default_address_base(),
            address_stride: default_address_stride(),
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the slot limit
    pub fn with_slot_limit(mut self, limit: usize) -> Self {
        self.slot_limit = limit;
        self
    }

    /// Builder method: enable or disable slot reclamation
    pub fn with_reclaim_slots(mut self, enabled: bool) -> Self {
        self.reclaim_slots = enabled;
        self
    }

    /// Builder method: set the simulated address layout
    pub fn with_address_layout(mut self, base: usize, stride: usize) -> Self {
        self.address_base = base;
        self.address_stride = stride;
        self
    }

    /// Check the configuration can back a bridge.
    ///
    /// The multiplexer permanently holds two slots, so fewer than two is rejected.
    pub fn validate(&self) -> Result<()> {
        if self.slot_limit < 2 {
            return Err(BridgeError::Config(format!(
                "slot_limit must be at least 2, got {}",
                self.slot_limit
            )));
        }
        if self.address_base == 0 {
            return Err(BridgeError::Config("address_base must be non-zero".to_string()));
        }
        if self.address_stride == 0 {
            return Err(BridgeError::Config("address_stride must be non-zero".to_string()));
        }
        let span = self
            .slot_limit
            .checked_mul(self.address_stride)
            .and_then(|span| span.checked_add(self.address_base));
        if span.is_none() {
            return Err(BridgeError::Config(
                "slot_limit * address_stride overflows the address space".to_string(),
            ));
        }
        Ok(())
    }
}
