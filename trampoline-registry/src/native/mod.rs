//! Native-side collaborators
//!
//! The registry never calls the native signal system or scheduler directly;
//! it goes through these traits. [`sim::SimulatedRuntime`] implements both
//! in-process for tests and the soak CLI.

use crate::types::{HandlerId, NativeAddress, ObjectHandle, SourceId};

pub mod library;
pub mod sim;

pub use library::SharedLibraries;
pub use sim::SimulatedRuntime;

/// How the native scheduler decides when a source is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Due on every main-loop iteration
    Idle,
    /// Due every `interval_ms`
    Timeout { interval_ms: u32 },
}

/// Native signal connection API
pub trait NativeSignals: Send + Sync {
    /// Connect `callback` to `signal` on `object`.
    ///
    /// Returns [`HandlerId::INVALID`] when the native side refuses the connection.
    fn connect(&self, object: ObjectHandle, signal: &str, callback: NativeAddress) -> HandlerId;

    /// Disconnect a handler. Unknown handlers are ignored.
    fn disconnect(&self, object: ObjectHandle, handler: HandlerId);
}

/// Native event-loop scheduler API
pub trait NativeMainLoop: Send + Sync {
    /// Schedule a repeating source. `callback` is called as
    /// `callback(user_data) -> keep` until it returns 0.
    fn add_source(&self, kind: SourceKind, callback: NativeAddress, user_data: usize) -> SourceId;

    /// Schedule a source that fires once. `callback` is called as
    /// `callback(user_data)` and its result ignored.
    fn add_source_once(&self, kind: SourceKind, callback: NativeAddress, user_data: usize) -> SourceId;

    /// Unschedule a source. Returns false if it was not scheduled.
    fn remove_source(&self, source: SourceId) -> bool;
}
