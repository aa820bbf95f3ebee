//! Signal connection manager
//!
//! Connecting one closure to several signals reuses a single native slot; each
//! connection gets its own handler mapping in the callback registry.

use crate::callbacks::CallbackRegistry;
use crate::native::NativeSignals;
use crate::types::{Closure, HandlerId, ObjectHandle, Result};
use std::sync::Arc;

/// Connects registered closures to native signals
pub struct SignalManager {
    callbacks: Arc<CallbackRegistry>,
    native: Arc<dyn NativeSignals>,
}

impl SignalManager {
    pub fn new(callbacks: Arc<CallbackRegistry>, native: Arc<dyn NativeSignals>) -> Self {
        Self { callbacks, native }
    }

    /// Connect `closure` to `signal` on `object`.
    ///
    /// # Returns
    /// * `Ok(handler)` - the native handler id; [`HandlerId::INVALID`] if the
    ///   native side refused, in which case nothing is recorded
    ///
    /// # Errors
    /// * `SlotsExhausted` if the closure needed a new slot and none was left
    pub fn connect(&self, object: ObjectHandle, signal: &str, closure: &Closure) -> Result<HandlerId> {
        // The pin keeps the slot bound while the native side holds the address
        // and no mapping exists yet.
        let (token, address) = self.callbacks.pin(closure)?;
        let handler = self.native.connect(object, signal, address);
        if handler.is_valid() {
            log::trace!("Connected '{}' on {:?} as {}", signal, object, handler);
        } else {
            log::debug!("Native connect of '{}' on {:?} returned no handler", signal, object);
        }
        self.callbacks.commit_handler_pin(handler, token);
        Ok(handler)
    }

    /// Disconnect a handler and release its mapping. Safe to call repeatedly.
    pub fn disconnect(&self, object: ObjectHandle, handler: HandlerId) {
        self.native.disconnect(object, handler);
        self.callbacks.remove_callback_by_handler(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::native::SimulatedRuntime;
    use crate::slots::{SlotPool, SlotProvider};
    use crate::types::NativeAddress;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        pool: Arc<SlotPool>,
        callbacks: Arc<CallbackRegistry>,
        runtime: Arc<SimulatedRuntime>,
        signals: SignalManager,
    }

    fn fixture() -> Fixture {
        let pool = Arc::new(
            SlotPool::new(&BridgeConfig::new().with_reclaim_slots(true).with_slot_limit(8)).unwrap(),
        );
        let callbacks = Arc::new(CallbackRegistry::new(pool.clone()));
        let runtime = Arc::new(SimulatedRuntime::new(pool.clone()));
        let signals = SignalManager::new(callbacks.clone(), runtime.clone());
        Fixture {
            pool,
            callbacks,
            runtime,
            signals,
        }
    }

    #[test]
    fn test_one_slot_for_many_signals() {
        let f = fixture();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let closure = Closure::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            0
        });
        let button = ObjectHandle(0x10);

        let clicked = f.signals.connect(button, "clicked", &closure).unwrap();
        let pressed = f.signals.connect(button, "pressed", &closure).unwrap();
        assert_ne!(clicked, pressed);
        assert_eq!(f.pool.in_use(), 1);
        assert_eq!(f.callbacks.handler_token(clicked), f.callbacks.handler_token(pressed));

        f.runtime.emit(button, "clicked", &[]);
        f.runtime.emit(button, "pressed", &[]);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        f.signals.disconnect(button, clicked);
        assert_eq!(f.pool.in_use(), 1);
        f.signals.disconnect(button, pressed);
        assert_eq!(f.pool.in_use(), 0);
        assert!(f.callbacks.is_empty());
    }

    #[test]
    fn test_refused_connection_rolls_back() {
        let f = fixture();
        f.runtime.refuse_connections(true);
        let closure = Closure::new(|_| 0);

        let handler = f.signals.connect(ObjectHandle(1), "clicked", &closure).unwrap();

        assert_eq!(handler, HandlerId::INVALID);
        assert!(f.callbacks.token_for(&closure).is_none());
        assert_eq!(f.pool.in_use(), 0);
    }

    #[test]
    fn test_refused_connection_keeps_existing_registration() {
        let f = fixture();
        let closure = Closure::new(|_| 0);
        let object = ObjectHandle(1);
        let first = f.signals.connect(object, "clicked", &closure).unwrap();

        f.runtime.refuse_connections(true);
        let second = f.signals.connect(object, "pressed", &closure).unwrap();

        assert!(!second.is_valid());
        let token = f.callbacks.handler_token(first).unwrap();
        assert_eq!(f.callbacks.ref_count(token), 2);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let f = fixture();
        let object = ObjectHandle(7);
        let handler = f
            .signals
            .connect(object, "destroy", &Closure::new(|_| 0))
            .unwrap();

        f.signals.disconnect(object, handler);
        f.signals.disconnect(object, handler);
        f.signals.disconnect(object, HandlerId::INVALID);

        assert_eq!(f.runtime.connection_count(), 0);
        assert_eq!(f.pool.in_use(), 0);
    }

    /// Native side that disconnects another handler of the same closure
    /// while a connection is being made
    struct DisconnectingSignals {
        runtime: Arc<SimulatedRuntime>,
        callbacks: Arc<CallbackRegistry>,
        victim: Mutex<Option<(ObjectHandle, HandlerId)>>,
    }

    impl NativeSignals for DisconnectingSignals {
        fn connect(&self, object: ObjectHandle, signal: &str, callback: NativeAddress) -> HandlerId {
            if let Some((owner, handler)) = self.victim.lock().take() {
                self.runtime.disconnect(owner, handler);
                self.callbacks.remove_callback_by_handler(handler);
            }
            self.runtime.connect(object, signal, callback)
        }

        fn disconnect(&self, object: ObjectHandle, handler: HandlerId) {
            self.runtime.disconnect(object, handler);
        }
    }

    fn counting(count: &Arc<AtomicUsize>) -> Closure {
        let seen = count.clone();
        Closure::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            0
        })
    }

    #[test]
    fn test_last_mapping_removed_during_connect_keeps_slot() {
        let f = fixture();
        let native = Arc::new(DisconnectingSignals {
            runtime: f.runtime.clone(),
            callbacks: f.callbacks.clone(),
            victim: Mutex::new(None),
        });
        let signals = SignalManager::new(f.callbacks.clone(), native.clone());
        let button = ObjectHandle(0x20);
        let a_count = Arc::new(AtomicUsize::new(0));
        let b_count = Arc::new(AtomicUsize::new(0));
        let a = counting(&a_count);

        let clicked = signals.connect(button, "clicked", &a).unwrap();
        *native.victim.lock() = Some((button, clicked));
        let pressed = signals.connect(button, "pressed", &a).unwrap();

        assert!(pressed.is_valid());
        assert!(f.callbacks.handler_token(clicked).is_none());
        let token = f.callbacks.handler_token(pressed).unwrap();
        assert_eq!(f.callbacks.token_for(&a), Some(token));
        assert_eq!(f.callbacks.ref_count(token), 2);
        assert_eq!(f.pool.in_use(), 1);

        // An unrelated closure must not take over the slot "pressed" calls
        let b = counting(&b_count);
        let b_token = f.callbacks.register(Some(&b)).unwrap().unwrap();
        assert_ne!(f.callbacks.lookup(b_token), f.callbacks.lookup(token));

        f.runtime.emit(button, "pressed", &[]);
        f.runtime.emit(button, "clicked", &[]);
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 0);

        signals.disconnect(button, pressed);
        assert!(!f.callbacks.contains(token));
        assert_eq!(f.pool.in_use(), 1);
    }
}
