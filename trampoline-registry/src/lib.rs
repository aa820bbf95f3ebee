//! Trampoline Registry Library
//!
//! Bridges managed closures to a native runtime that can only call plain
//! function addresses. Closures are bound to a bounded pool of native slots,
//! and the registry keeps them alive for as long as the native side may call
//! them.
//!
//! # Architecture
//!
//! - [`callbacks`] maps closure identity to a slot and reference-counts the
//!   signal handler and event-loop source ids that use it
//! - [`trampoline`] multiplexes every scheduled source through two shared
//!   entry points and a dispatch table, so sources consume no slots
//! - [`signals`] connects closures to native signals, one slot per closure
//! - [`bridge`] owns all of the above plus the native collaborators
//!
//! The native runtime sits behind the [`native::NativeSignals`] and
//! [`native::NativeMainLoop`] traits. [`SimulatedRuntime`] implements both
//! in-process.
//!
//! # Example Usage
//!
//! ```
//! use trampoline_registry::{Bridge, BridgeConfig, Closure, ObjectHandle, SourceAction};
//!
//! let config = BridgeConfig::new().with_slot_limit(64).with_reclaim_slots(true);
//! let (bridge, runtime) = Bridge::simulated(config).unwrap();
//!
//! let button = ObjectHandle(0x1000);
//! let handler = bridge
//!     .connect_signal(button, "clicked", &Closure::new(|_| 0))
//!     .unwrap();
//! runtime.emit(button, "clicked", &[]);
//!
//! bridge.idle_add(|| SourceAction::Remove).unwrap();
//! runtime.run_until_idle(10);
//!
//! bridge.disconnect_signal(button, handler);
//! assert_eq!(bridge.stats().live_callbacks, 0);
//! ```

// Public modules
pub mod arena;
pub mod bridge;
pub mod callbacks;
pub mod config;
pub mod marshal;
pub mod native;
pub mod signals;
pub mod slots;
pub mod trampoline;
pub mod types;

// Re-export main types for convenience
pub use arena::Token;
pub use bridge::{Bridge, BridgeStats};
pub use callbacks::CallbackRegistry;
pub use config::{BridgeConfig, DEFAULT_SLOT_LIMIT};
pub use native::{NativeMainLoop, NativeSignals, SharedLibraries, SimulatedRuntime, SourceKind};
pub use signals::SignalManager;
pub use slots::{PoolStats, SlotPool, SlotProvider};
pub use trampoline::{DispatchKind, SourceFunc, SourceTrampolines};
pub use types::{
    BridgeError, Closure, ClosureId, DispatchId, HandlerId, NativeAddress, NativeError,
    ObjectHandle, Result, SourceAction, SourceId,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: a default bridge comes up with only its entry points
        let (bridge, _runtime) = Bridge::simulated(BridgeConfig::default()).unwrap();
        let stats = bridge.stats();
        assert_eq!(stats.slots_in_use, 2);
        assert_eq!(stats.slot_limit, DEFAULT_SLOT_LIMIT);
    }
}
