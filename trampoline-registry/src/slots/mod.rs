//! Native slot providers
//!
//! A slot provider promotes a managed closure to a foreign-callable address drawn
//! from a bounded pool. Only the callback registry and the source multiplexer
//! allocate or release slots.

use crate::types::{Closure, NativeAddress, Result};

pub mod pool;

pub use pool::{PoolStats, SlotPool};

/// Allocates and releases foreign-callable addresses
pub trait SlotProvider: Send + Sync {
    /// Bind `closure` to a fresh native address.
    ///
    /// Fails with [`crate::BridgeError::SlotsExhausted`] when the pool is empty.
    /// That failure is not retryable.
    fn allocate(&self, closure: Closure) -> Result<NativeAddress>;

    /// Unbind an address. Best effort: a no-op for slot accounting when
    /// [`SlotProvider::supports_release`] is false.
    fn release(&self, address: NativeAddress);

    /// Whether released slots can be handed out again
    fn supports_release(&self) -> bool;

    /// Call through a native address the way the native side would.
    ///
    /// Returns `None` if nothing is bound to `address`.
    fn invoke(&self, address: NativeAddress, args: &[usize]) -> Option<usize>;

    /// Number of slots currently consumed (released-but-unreclaimed included)
    fn in_use(&self) -> usize;

    /// Hard pool limit
    fn limit(&self) -> usize;
}
