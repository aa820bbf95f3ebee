//! Core types for the trampoline registry
//!
//! This module defines the identifiers, closure wrapper and error type shared by
//! every component. Identifiers handed out by the native side (signal handler ids,
//! source ids) use 0 as their "invalid" value, matching the native API.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Signature every native slot is bound to: machine-word arguments in, one word out.
pub type NativeFn = dyn Fn(&[usize]) -> usize + Send + Sync;

static NEXT_CLOSURE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a managed closure.
///
/// Assigned once in [`Closure::new`] and shared by every clone of that closure,
/// so "the same closure registered twice" is decided by id, never by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClosureId(u64);

impl ClosureId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// A managed callable value that can be bound to a native slot
#[derive(Clone)]
pub struct Closure {
    id: ClosureId,
    func: Arc<NativeFn>,
}

impl Closure {
    /// Wrap a Rust closure, giving it a fresh identity
    pub fn new(func: impl Fn(&[usize]) -> usize + Send + Sync + 'static) -> Self {
        Self {
            id: ClosureId(NEXT_CLOSURE_ID.fetch_add(1, Ordering::Relaxed)),
            func: Arc::new(func),
        }
    }

    /// Identity shared by all clones of this closure
    pub fn id(&self) -> ClosureId {
        self.id
    }

    /// Invoke the closure with native-style arguments
    pub fn call(&self, args: &[usize]) -> usize {
        (self.func)(args)
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure").field("id", &self.id.0).finish()
    }
}

/// A foreign-callable function pointer handed out by a slot provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeAddress(NonZeroUsize);

impl NativeAddress {
    /// Returns `None` for the null address
    pub fn new(address: usize) -> Option<Self> {
        NonZeroUsize::new(address).map(Self)
    }

    pub fn get(self) -> usize {
        self.0.get()
    }
}

impl fmt::Display for NativeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0.get())
    }
}

/// Signal handler id returned by the native connect call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

impl HandlerId {
    pub const INVALID: HandlerId = HandlerId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// Event-loop source id returned by the native scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u32);

impl SourceId {
    pub const INVALID: SourceId = SourceId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Multiplexer key carried to the native side as user data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchId(pub(crate) u64);

impl DispatchId {
    /// Decode the id from the user-data word the native side passes back
    pub fn from_user_data(user_data: usize) -> Self {
        Self(user_data as u64)
    }

    pub fn as_user_data(self) -> usize {
        self.0 as usize
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Opaque pointer to a native object that can emit signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub usize);

/// Result of running a source callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceAction {
    /// Keep the source scheduled
    Continue,
    /// Remove the source after this invocation
    Remove,
}

impl SourceAction {
    /// Native boolean convention (1 = keep, 0 = remove)
    pub fn to_native(self) -> usize {
        match self {
            SourceAction::Continue => 1,
            SourceAction::Remove => 0,
        }
    }

    pub fn from_native(value: usize) -> Self {
        if value != 0 {
            SourceAction::Continue
        } else {
            SourceAction::Remove
        }
    }
}

/// Errors that can occur while bridging callbacks
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The bounded native slot pool is exhausted. Not retryable.
    #[error("Native slot pool exhausted (limit: {limit})")]
    SlotsExhausted { limit: usize },

    #[error("Address 0x{0:X} does not belong to this slot pool")]
    InvalidAddress(usize),

    #[error("Failed to load shared library: {0}")]
    Library(String),

    #[error("Symbol not found in any loaded library: {0}")]
    SymbolNotFound(String),

    #[error("String cannot be passed to native code: {0}")]
    InvalidString(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Owned copy of an error record reported by the native runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    /// Error domain (a quark on the native side)
    pub domain: u32,
    /// Domain-specific error code
    pub code: i32,
    /// Human-readable message
    pub message: String,
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "native runtime reported an error with message: '{}', domain: '{}' and code: '{}'",
            self.message, self.domain, self.code
        )
    }
}

impl std::error::Error for NativeError {}
