//! Callback registry
//!
//! Maps a closure identity to the native slot it is bound to and retains the
//! closure for as long as the slot may be called. The reference-counted
//! handler/source index lives in [`mapping`] and shares this registry's lock,
//! because eviction has to observe both tables and the entries atomically.

use crate::arena::{Arena, Token};
use crate::slots::SlotProvider;
use crate::types::{Closure, ClosureId, HandlerId, NativeAddress, Result, SourceId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub mod mapping;

/// A registered closure and the slot bound to it
struct CallbackEntry {
    /// Keeps the closure alive while the native side may call `address`
    closure: Closure,
    address: NativeAddress,
    /// One implicit reference for being registered, plus one per mapping
    /// and one per pin
    refs: u32,
    /// Native calls in flight that will end in a mapping (or nothing)
    pins: u32,
    /// Nothing but pins needs the existence reference any more; it goes
    /// when the last pin is dropped without a mapping
    detached: bool,
}

/// State guarded by the registry lock
pub(crate) struct CallbackState {
    entries: Arena<CallbackEntry>,
    by_closure: HashMap<ClosureId, Token>,
    handlers: HashMap<HandlerId, Token>,
    sources: HashMap<SourceId, Token>,
}

impl CallbackState {
    fn new() -> Self {
        Self {
            entries: Arena::new(),
            by_closure: HashMap::new(),
            handlers: HashMap::new(),
            sources: HashMap::new(),
        }
    }

    /// Drop an entry and its identity index. Mappings are the caller's business.
    fn evict(&mut self, token: Token) -> Option<NativeAddress> {
        let entry = self.entries.remove(token)?;
        self.by_closure.remove(&entry.closure.id());
        log::debug!(
            "Evicted {} (closure {}) from slot {}",
            token,
            entry.closure.id().get(),
            entry.address
        );
        Some(entry.address)
    }
}

/// Registry of closures promoted to native slots
pub struct CallbackRegistry {
    state: RwLock<CallbackState>,
    provider: Arc<dyn SlotProvider>,
}

impl CallbackRegistry {
    /// Create an empty registry drawing slots from `provider`
    pub fn new(provider: Arc<dyn SlotProvider>) -> Self {
        Self {
            state: RwLock::new(CallbackState::new()),
            provider,
        }
    }

    /// Register a closure and return its token.
    ///
    /// `None` registers nothing and returns `Ok(None)`. Registering a closure
    /// that is already registered returns the existing token without touching
    /// its reference count.
    ///
    /// # Errors
    /// * `SlotsExhausted` if the slot provider has no slot left
    pub fn register(&self, closure: Option<&Closure>) -> Result<Option<Token>> {
        let Some(closure) = closure else {
            return Ok(None);
        };

        let mut state = self.state.write();
        let (token, _, _) = self.register_locked(&mut state, closure)?;
        if let Some(entry) = state.entries.get_mut(token) {
            // An explicit registration owns the existence reference again.
            entry.detached = false;
        }
        Ok(Some(token))
    }

    /// Find or create the entry for `closure` under an already held lock.
    /// Returns the token, its address and whether this call created it.
    fn register_locked(
        &self,
        state: &mut CallbackState,
        closure: &Closure,
    ) -> Result<(Token, NativeAddress, bool)> {
        if let Some(&token) = state.by_closure.get(&closure.id()) {
            if let Some(entry) = state.entries.get(token) {
                return Ok((token, entry.address, false));
            }
        }

        let address = self.provider.allocate(closure.clone())?;
        let token = state.entries.insert(CallbackEntry {
            closure: closure.clone(),
            address,
            refs: 1,
            pins: 0,
            detached: false,
        });
        state.by_closure.insert(closure.id(), token);
        log::debug!(
            "Registered closure {} as {} at {}",
            closure.id().get(),
            token,
            address
        );
        Ok((token, address, true))
    }

    /// Native address bound to `token`, if it is still registered
    pub fn lookup(&self, token: Token) -> Option<NativeAddress> {
        self.state.read().entries.get(token).map(|entry| entry.address)
    }

    /// Token of an already registered closure
    pub fn token_for(&self, closure: &Closure) -> Option<Token> {
        self.state.read().by_closure.get(&closure.id()).copied()
    }

    /// Unconditionally drop a registration and release its slot.
    ///
    /// Any handler or source mapping still pointing at `token` is purged too,
    /// so a stale id can never resolve to an evicted closure. Unknown tokens
    /// are ignored.
    pub fn remove(&self, token: Token) {
        let mut state = self.state.write();
        state.handlers.retain(|_, mapped| *mapped != token);
        state.sources.retain(|_, mapped| *mapped != token);
        match state.evict(token) {
            Some(address) => self.provider.release(address),
            None => log::trace!("Ignoring removal of unknown {}", token),
        }
    }

    /// Current reference count (0 when not registered)
    pub fn ref_count(&self, token: Token) -> u32 {
        self.state
            .read()
            .entries
            .get(token)
            .map_or(0, |entry| entry.refs)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.state.read().entries.contains(token)
    }

    /// Number of registered closures
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live handler mappings
    pub fn handler_count(&self) -> usize {
        self.state.read().handlers.len()
    }

    /// Number of live source mappings
    pub fn source_count(&self) -> usize {
        self.state.read().sources.len()
    }

    /// Drop every registration and mapping, releasing all slots
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.handlers.clear();
        state.sources.clear();
        state.by_closure.clear();
        let entries = state.entries.drain();
        if !entries.is_empty() {
            log::debug!("Releasing {} remaining callback slots", entries.len());
        }
        for entry in entries {
            self.provider.release(entry.address);
        }
    }
}
