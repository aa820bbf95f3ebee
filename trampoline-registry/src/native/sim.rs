//! In-process stand-in for the native signal system and main loop
//!
//! Behaves like a single-threaded native event loop: signal emission and
//! source dispatch call straight through native addresses via the slot
//! provider, and time is virtual (it only moves when [`SimulatedRuntime::advance`]
//! is called).

use crate::native::{NativeMainLoop, NativeSignals, SourceKind};
use crate::slots::SlotProvider;
use crate::types::{HandlerId, NativeAddress, ObjectHandle, SourceId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A captured native invocation, replayable after its source is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub callback: NativeAddress,
    pub user_data: usize,
}

struct Connection {
    object: ObjectHandle,
    signal: String,
    callback: NativeAddress,
}

struct ScheduledSource {
    kind: SourceKind,
    callback: NativeAddress,
    user_data: usize,
    once: bool,
    due_at: u64,
}

struct SimState {
    now_ms: u64,
    next_handler: u64,
    next_source: u32,
    handlers: BTreeMap<HandlerId, Connection>,
    sources: BTreeMap<SourceId, ScheduledSource>,
    refuse_connections: bool,
}

impl SimState {
    fn due_at(&self, kind: SourceKind) -> u64 {
        match kind {
            SourceKind::Idle => self.now_ms,
            SourceKind::Timeout { interval_ms } => self.now_ms + interval_ms as u64,
        }
    }

    fn schedule(&mut self, kind: SourceKind, callback: NativeAddress, user_data: usize, once: bool) -> SourceId {
        self.next_source += 1;
        let id = SourceId(self.next_source);
        let due_at = self.due_at(kind);
        self.sources.insert(
            id,
            ScheduledSource {
                kind,
                callback,
                user_data,
                once,
                due_at,
            },
        );
        id
    }
}

/// Simulated native runtime
pub struct SimulatedRuntime {
    provider: Arc<dyn SlotProvider>,
    state: Mutex<SimState>,
}

impl SimulatedRuntime {
    /// Create a runtime that calls native addresses through `provider`
    pub fn new(provider: Arc<dyn SlotProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(SimState {
                now_ms: 0,
                next_handler: 0,
                next_source: 0,
                handlers: BTreeMap::new(),
                sources: BTreeMap::new(),
                refuse_connections: false,
            }),
        }
    }

    /// Make subsequent connects fail with handler id 0
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Emit `signal` on `object`, calling every connected handler in
    /// connection order. Returns the number of handlers called.
    pub fn emit(&self, object: ObjectHandle, signal: &str, args: &[usize]) -> usize {
        let callbacks: Vec<NativeAddress> = {
            let state = self.state.lock();
            state
                .handlers
                .values()
                .filter(|conn| conn.object == object && conn.signal == signal)
                .map(|conn| conn.callback)
                .collect()
        };

        let mut called = 0;
        for callback in callbacks {
            if self.provider.invoke(callback, args).is_some() {
                called += 1;
            } else {
                log::warn!("Signal '{}' handler at {} is not bound", signal, callback);
            }
        }
        called
    }

    /// Run one main-loop iteration at the current virtual time.
    ///
    /// Every due source is dispatched once; returns how many were dispatched.
    pub fn iterate(&self) -> usize {
        let due: Vec<SourceId> = {
            let state = self.state.lock();
            let now = state.now_ms;
            state
                .sources
                .iter()
                .filter(|(_, source)| source.due_at <= now)
                .map(|(id, _)| *id)
                .collect()
        };

        let mut dispatched = 0;
        for id in due {
            // An earlier callback in this pass may have removed it.
            let (delivery, once) = {
                let mut state = self.state.lock();
                let Some(source) = state.sources.get(&id) else {
                    continue;
                };
                let delivery = Delivery {
                    callback: source.callback,
                    user_data: source.user_data,
                };
                let once = source.once;
                if once {
                    state.sources.remove(&id);
                }
                (delivery, once)
            };

            let result = self.deliver(delivery);
            dispatched += 1;
            if once {
                continue;
            }

            let mut state = self.state.lock();
            let keep = matches!(result, Some(value) if value != 0);
            if !keep {
                state.sources.remove(&id);
                continue;
            }
            let now = state.now_ms;
            if let Some(source) = state.sources.get_mut(&id) {
                source.due_at = match source.kind {
                    SourceKind::Idle => now,
                    SourceKind::Timeout { interval_ms } => now + interval_ms.max(1) as u64,
                };
            }
        }
        dispatched
    }

    /// Move virtual time forward by `ms` and run one iteration
    pub fn advance(&self, ms: u64) -> usize {
        self.state.lock().now_ms += ms;
        self.iterate()
    }

    /// Iterate until no source is due or `max_iterations` is reached.
    /// Returns the total number of dispatches.
    pub fn run_until_idle(&self, max_iterations: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_iterations {
            let dispatched = self.iterate();
            if dispatched == 0 {
                break;
            }
            total += dispatched;
        }
        total
    }

    /// Capture what the native side would pass when `source` fires
    pub fn pending_delivery(&self, source: SourceId) -> Option<Delivery> {
        self.state.lock().sources.get(&source).map(|source| Delivery {
            callback: source.callback,
            user_data: source.user_data,
        })
    }

    /// Perform a native invocation directly, bypassing the schedule
    pub fn deliver(&self, delivery: Delivery) -> Option<usize> {
        self.provider.invoke(delivery.callback, &[delivery.user_data])
    }

    /// Number of scheduled sources
    pub fn pending_sources(&self) -> usize {
        self.state.lock().sources.len()
    }

    /// Number of connected signal handlers
    pub fn connection_count(&self) -> usize {
        self.state.lock().handlers.len()
    }

    /// Current virtual time
    pub fn now_ms(&self) -> u64 {
        self.state.lock().now_ms
    }
}

impl NativeSignals for SimulatedRuntime {
    fn connect(&self, object: ObjectHandle, signal: &str, callback: NativeAddress) -> HandlerId {
        let mut state = self.state.lock();
        if state.refuse_connections {
            return HandlerId::INVALID;
        }
        state.next_handler += 1;
        let handler = HandlerId(state.next_handler);
        state.handlers.insert(
            handler,
            Connection {
                object,
                signal: signal.to_string(),
                callback,
            },
        );
        handler
    }

    fn disconnect(&self, object: ObjectHandle, handler: HandlerId) {
        let mut state = self.state.lock();
        if state.handlers.get(&handler).is_some_and(|conn| conn.object == object) {
            state.handlers.remove(&handler);
        }
    }
}

impl NativeMainLoop for SimulatedRuntime {
    fn add_source(&self, kind: SourceKind, callback: NativeAddress, user_data: usize) -> SourceId {
        self.state.lock().schedule(kind, callback, user_data, false)
    }

    fn add_source_once(&self, kind: SourceKind, callback: NativeAddress, user_data: usize) -> SourceId {
        self.state.lock().schedule(kind, callback, user_data, true)
    }

    fn remove_source(&self, source: SourceId) -> bool {
        self.state.lock().sources.remove(&source).is_some()
    }
}
