//! Bounded in-process slot pool
//!
//! Hands out addresses `address_base + index * address_stride` for up to
//! `slot_limit` slots. When reclamation is disabled a released slot is unbound
//! but never handed out again, so it keeps counting against the limit.

use crate::config::BridgeConfig;
use crate::slots::SlotProvider;
use crate::types::{BridgeError, Closure, NativeAddress, Result};
use parking_lot::Mutex;
use serde::Serialize;

/// Usage counters for a slot pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Slots currently bound to a closure
    pub bound: usize,
    /// Slots consumed, including released slots that were not reclaimed
    pub in_use: usize,
    /// Highest `in_use` seen so far
    pub peak_in_use: usize,
    /// Total successful allocations
    pub allocations: u64,
    /// Total release calls that unbound a slot
    pub releases: u64,
    /// Hard limit
    pub limit: usize,
}

struct PoolState {
    /// Closure bound to each slot handed out so far
    bound: Vec<Option<Closure>>,
    /// Released slots available for reuse (only used when reclaiming)
    free: Vec<usize>,
    /// Slots that were released but can never be reused
    leaked: usize,
    stats: PoolStats,
    warned_no_reclaim: bool,
}

/// Bounded slot provider used by the simulated runtime and tests
pub struct SlotPool {
    limit: usize,
    reclaim: bool,
    base: usize,
    stride: usize,
    state: Mutex<PoolState>,
}

impl SlotPool {
    /// Create a pool from the bridge configuration
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            limit: config.slot_limit,
            reclaim: config.reclaim_slots,
            base: config.address_base,
            stride: config.address_stride,
            state: Mutex::new(PoolState {
                bound: Vec::new(),
                free: Vec::new(),
                leaked: 0,
                stats: PoolStats {
                    limit: config.slot_limit,
                    ..PoolStats::default()
                },
                warned_no_reclaim: false,
            }),
        })
    }

    /// Snapshot of the usage counters
    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    fn address_of(&self, index: usize) -> Result<NativeAddress> {
        let raw = self.base + index * self.stride;
        NativeAddress::new(raw).ok_or(BridgeError::InvalidAddress(raw))
    }

    fn index_of(&self, address: NativeAddress) -> Option<usize> {
        let offset = address.get().checked_sub(self.base)?;
        if offset % self.stride != 0 {
            return None;
        }
        let index = offset / self.stride;
        (index < self.limit).then_some(index)
    }
}

impl SlotProvider for SlotPool {
    fn allocate(&self, closure: Closure) -> Result<NativeAddress> {
        let mut state = self.state.lock();

        let index = if let Some(index) = state.free.pop() {
            index
        } else if state.bound.len() < self.limit {
            state.bound.push(None);
            state.bound.len() - 1
        } else {
            log::warn!("Native slot pool exhausted ({} slots)", self.limit);
            return Err(BridgeError::SlotsExhausted { limit: self.limit });
        };

        let address = self.address_of(index)?;
        log::trace!("Bound closure {} to slot {} at {}", closure.id().get(), index, address);
        state.bound[index] = Some(closure);

        state.stats.allocations += 1;
        state.stats.bound += 1;
        state.stats.in_use = state.stats.bound + state.leaked;
        state.stats.peak_in_use = state.stats.peak_in_use.max(state.stats.in_use);
        Ok(address)
    }

    fn release(&self, address: NativeAddress) {
        let Some(index) = self.index_of(address) else {
            log::trace!("Ignoring release of foreign address {}", address);
            return;
        };

        let mut state = self.state.lock();
        let Some(slot) = state.bound.get_mut(index) else {
            return;
        };
        if slot.take().is_none() {
            return;
        }

        state.stats.bound -= 1;
        state.stats.releases += 1;
        if self.reclaim {
            state.free.push(index);
        } else {
            state.leaked += 1;
            if !state.warned_no_reclaim {
                state.warned_no_reclaim = true;
                log::warn!(
                    "Slot reclamation unsupported: released slots stay consumed until process exit"
                );
            }
        }
        state.stats.in_use = state.stats.bound + state.leaked;
    }

    fn supports_release(&self) -> bool {
        self.reclaim
    }

    fn invoke(&self, address: NativeAddress, args: &[usize]) -> Option<usize> {
        let index = self.index_of(address)?;
        // Clone out of the lock so the closure may allocate or release slots.
        let closure = self.state.lock().bound.get(index)?.clone()?;
        Some(closure.call(args))
    }

    fn in_use(&self) -> usize {
        self.state.lock().stats.in_use
    }

    fn limit(&self) -> usize {
        self.limit
    }
}
