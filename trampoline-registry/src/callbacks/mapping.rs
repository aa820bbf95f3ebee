//! Reference-counted handler/source index
//!
//! A closure can back a signal handler and an event-loop source at the same
//! time, or sit in either table under several ids. Its slot may only go once
//! no id in either table points at it any more.
//!
//! Counting is biased: registration gives a token one "existence" reference
//! and every mapping adds one. Dropping the last mapping releases both the
//! mapping's reference and the existence reference, so the count hits zero
//! exactly when no external mapping is left.
//!
//! A native connect or schedule call hands out the slot address before the
//! mapping for the resulting id exists. [`CallbackRegistry::pin`] holds an
//! extra reference across that call so a concurrent removal of the closure's
//! other mappings cannot evict it in between; the pin then either turns into
//! the new mapping's reference or is dropped.

use super::{CallbackRegistry, CallbackState};
use crate::arena::Token;
use crate::types::{Closure, HandlerId, NativeAddress, Result, SourceId};

/// Key into one of the two index tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MappingKey {
    Handler(HandlerId),
    Source(SourceId),
}

impl MappingKey {
    fn is_valid(self) -> bool {
        match self {
            MappingKey::Handler(id) => id.is_valid(),
            MappingKey::Source(id) => id.is_valid(),
        }
    }
}

impl CallbackState {
    fn mapped_token(&self, key: MappingKey) -> Option<Token> {
        match key {
            MappingKey::Handler(id) => self.handlers.get(&id).copied(),
            MappingKey::Source(id) => self.sources.get(&id).copied(),
        }
    }

    fn insert_mapping(&mut self, key: MappingKey, token: Token) {
        match key {
            MappingKey::Handler(id) => self.handlers.insert(id, token),
            MappingKey::Source(id) => self.sources.insert(id, token),
        };
    }

    fn remove_mapping(&mut self, key: MappingKey) -> Option<Token> {
        match key {
            MappingKey::Handler(id) => self.handlers.remove(&id),
            MappingKey::Source(id) => self.sources.remove(&id),
        }
    }

    /// Linear scan of both tables. Only used on removal paths.
    pub(crate) fn has_callback_mappings(&self, token: Token) -> bool {
        self.handlers.values().any(|mapped| *mapped == token)
            || self.sources.values().any(|mapped| *mapped == token)
    }

    fn acquire_ref(&mut self, token: Token) -> bool {
        match self.entries.get_mut(token) {
            Some(entry) => {
                entry.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Decrement, evicting at zero. Returns the address to release on eviction.
    fn release_ref(&mut self, token: Token) -> Option<NativeAddress> {
        let entry = self.entries.get_mut(token)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return None;
        }
        self.evict(token)
    }

    /// Release the reference held by a mapping that was just dropped, plus the
    /// existence reference if that was the token's last mapping.
    fn release_mapping_ref(&mut self, token: Token) -> Option<NativeAddress> {
        if let Some(address) = self.release_ref(token) {
            return Some(address);
        }
        if self.has_callback_mappings(token) {
            return None;
        }
        let entry = self.entries.get_mut(token)?;
        if entry.pins > 0 {
            // A native call is about to map it; the last pin decides.
            entry.detached = true;
            return None;
        }
        self.release_ref(token)
    }

    /// Release a pin's reference, plus the existence reference if the pin
    /// was the last thing keeping a detached entry alive.
    fn release_pin_ref(&mut self, token: Token) -> Option<NativeAddress> {
        if let Some(address) = self.release_ref(token) {
            return Some(address);
        }
        let entry = self.entries.get(token)?;
        if entry.pins > 0 || !entry.detached || self.has_callback_mappings(token) {
            return None;
        }
        self.release_ref(token)
    }
}

impl CallbackRegistry {
    /// Record that signal handler `handler` invokes the closure behind `token`.
    ///
    /// Id 0 is ignored. Re-saving the same pair is a no-op. If `handler` was
    /// mapped to another token, that token loses the mapping first and is
    /// evicted if it was its last.
    pub fn save_handler_mapping(&self, handler: HandlerId, token: Token) {
        self.save_mapping(MappingKey::Handler(handler), token);
    }

    /// Record that event-loop source `source` invokes the closure behind `token`
    pub fn save_source_mapping(&self, source: SourceId, token: Token) {
        self.save_mapping(MappingKey::Source(source), token);
    }

    /// Drop the mapping for `handler` and release its references.
    ///
    /// Returns false if `handler` was not mapped.
    pub fn remove_callback_by_handler(&self, handler: HandlerId) -> bool {
        self.remove_callback_by(MappingKey::Handler(handler))
    }

    /// Drop the mapping for `source` and release its references
    pub fn remove_callback_by_source(&self, source: SourceId) -> bool {
        self.remove_callback_by(MappingKey::Source(source))
    }

    /// Whether any handler or source id still points at `token`
    pub fn has_callback_mappings(&self, token: Token) -> bool {
        self.state.read().has_callback_mappings(token)
    }

    /// Token a handler id is mapped to
    pub fn handler_token(&self, handler: HandlerId) -> Option<Token> {
        self.state.read().handlers.get(&handler).copied()
    }

    /// Token a source id is mapped to
    pub fn source_token(&self, source: SourceId) -> Option<Token> {
        self.state.read().sources.get(&source).copied()
    }

    /// Register `closure` (or find its registration) and pin it.
    ///
    /// The pin keeps the entry and its slot alive until it is handed to
    /// [`CallbackRegistry::commit_handler_pin`] or
    /// [`CallbackRegistry::commit_source_pin`], whatever happens to the
    /// closure's other mappings meanwhile. Every pin must be committed.
    ///
    /// # Errors
    /// * `SlotsExhausted` if the closure needed a new slot and none was left
    pub fn pin(&self, closure: &Closure) -> Result<(Token, NativeAddress)> {
        let mut state = self.state.write();
        let (token, address, fresh) = self.register_locked(&mut state, closure)?;
        if let Some(entry) = state.entries.get_mut(token) {
            entry.refs += 1;
            entry.pins += 1;
            entry.detached |= fresh;
        }
        Ok((token, address))
    }

    /// Finish a pinned native connect.
    ///
    /// A valid `handler` takes over the pin's reference as its mapping. An
    /// invalid one (the native side refused) just drops the pin, evicting
    /// the entry if this call created it and nothing else maps it.
    pub fn commit_handler_pin(&self, handler: HandlerId, token: Token) {
        self.commit_pin(MappingKey::Handler(handler), token);
    }

    /// Finish a pinned native schedule; see [`CallbackRegistry::commit_handler_pin`]
    pub fn commit_source_pin(&self, source: SourceId, token: Token) {
        self.commit_pin(MappingKey::Source(source), token);
    }

    fn commit_pin(&self, key: MappingKey, token: Token) {
        let mut state = self.state.write();
        match state.entries.get_mut(token) {
            Some(entry) => {
                entry.pins = entry.pins.saturating_sub(1);
                if key.is_valid() {
                    entry.detached = false;
                }
            }
            None => {
                log::warn!("Pinned {} was removed before {:?} was recorded", token, key);
                return;
            }
        }

        if !key.is_valid() {
            if let Some(address) = state.release_pin_ref(token) {
                self.provider.release(address);
            }
            return;
        }

        let previous = state.mapped_token(key);
        if previous == Some(token) {
            // Already mapped; that mapping holds its own reference.
            if let Some(address) = state.release_pin_ref(token) {
                self.provider.release(address);
            }
            return;
        }

        // The pin's reference becomes the mapping's.
        state.insert_mapping(key, token);
        if let Some(previous) = previous {
            log::debug!("{:?} moved from {} to {}", key, previous, token);
            if let Some(address) = state.release_mapping_ref(previous) {
                self.provider.release(address);
            }
        }
    }

    fn save_mapping(&self, key: MappingKey, token: Token) {
        if !key.is_valid() {
            return;
        }

        let mut state = self.state.write();
        if !state.entries.contains(token) {
            log::warn!("Not mapping {:?} to unregistered {}", key, token);
            return;
        }

        let previous = state.mapped_token(key);
        if previous == Some(token) {
            return;
        }

        // Re-point first so the old token's scan no longer sees this id.
        state.insert_mapping(key, token);
        state.acquire_ref(token);

        if let Some(previous) = previous {
            log::debug!("{:?} moved from {} to {}", key, previous, token);
            if let Some(address) = state.release_mapping_ref(previous) {
                self.provider.release(address);
            }
        }
    }

    fn remove_callback_by(&self, key: MappingKey) -> bool {
        let mut state = self.state.write();
        let Some(token) = state.remove_mapping(key) else {
            log::trace!("No callback mapped for {:?}", key);
            return false;
        };

        if let Some(address) = state.release_mapping_ref(token) {
            self.provider.release(address);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::arena::Token;
    use crate::callbacks::CallbackRegistry;
    use crate::config::BridgeConfig;
    use crate::slots::{SlotPool, SlotProvider};
    use crate::types::{Closure, HandlerId, SourceId};
    use std::sync::Arc;

    fn setup() -> (CallbackRegistry, Arc<SlotPool>) {
        let pool = Arc::new(
            SlotPool::new(&BridgeConfig::new().with_reclaim_slots(true).with_slot_limit(16)).unwrap(),
        );
        (CallbackRegistry::new(pool.clone()), pool)
    }

    fn register(registry: &CallbackRegistry) -> Token {
        registry
            .register(Some(&Closure::new(|_| 0)))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_single_mapping_lifecycle() {
        let (registry, pool) = setup();
        let token = register(&registry);
        assert_eq!(registry.ref_count(token), 1);

        registry.save_handler_mapping(HandlerId(1), token);
        assert_eq!(registry.ref_count(token), 2);

        assert!(registry.remove_callback_by_handler(HandlerId(1)));
        assert_eq!(registry.ref_count(token), 0);
        assert!(!registry.contains(token));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_ref_count_symmetry() {
        let (registry, pool) = setup();
        let a = register(&registry);
        let b = register(&registry);

        registry.save_handler_mapping(HandlerId(1), a);
        registry.save_handler_mapping(HandlerId(2), a);
        registry.save_source_mapping(SourceId(1), a);
        registry.save_source_mapping(SourceId(2), b);
        registry.save_handler_mapping(HandlerId(3), b);
        assert_eq!(registry.ref_count(a), 4);
        assert_eq!(registry.ref_count(b), 3);

        registry.remove_callback_by_source(SourceId(1));
        registry.remove_callback_by_handler(HandlerId(3));
        registry.remove_callback_by_handler(HandlerId(1));
        assert!(registry.contains(a));
        assert!(registry.contains(b));

        registry.remove_callback_by_source(SourceId(2));
        registry.remove_callback_by_handler(HandlerId(2));

        assert_eq!(registry.ref_count(a), 0);
        assert_eq!(registry.ref_count(b), 0);
        assert!(registry.is_empty());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_zero_ids_are_ignored() {
        let (registry, _pool) = setup();
        let token = register(&registry);

        registry.save_handler_mapping(HandlerId::INVALID, token);
        registry.save_source_mapping(SourceId::INVALID, token);

        assert_eq!(registry.ref_count(token), 1);
        assert_eq!(registry.handler_count(), 0);
        assert_eq!(registry.source_count(), 0);
    }

    #[test]
    fn test_resave_same_pair_is_noop() {
        let (registry, _pool) = setup();
        let token = register(&registry);

        registry.save_handler_mapping(HandlerId(5), token);
        registry.save_handler_mapping(HandlerId(5), token);

        assert_eq!(registry.ref_count(token), 2);
    }

    #[test]
    fn test_remapping_releases_previous_token() {
        let (registry, pool) = setup();
        let old = register(&registry);
        let new = register(&registry);

        registry.save_source_mapping(SourceId(3), old);
        registry.save_source_mapping(SourceId(3), new);

        // `old` lost its only mapping and is gone
        assert!(!registry.contains(old));
        assert_eq!(registry.ref_count(new), 2);
        assert_eq!(registry.source_token(SourceId(3)), Some(new));
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_remapping_keeps_shared_previous_token() {
        let (registry, _pool) = setup();
        let old = register(&registry);
        let new = register(&registry);

        registry.save_handler_mapping(HandlerId(1), old);
        registry.save_handler_mapping(HandlerId(2), old);
        registry.save_handler_mapping(HandlerId(1), new);

        assert!(registry.contains(old));
        assert_eq!(registry.ref_count(old), 2);
        assert!(registry.has_callback_mappings(old));
    }

    #[test]
    fn test_cross_table_sharing() {
        let (registry, _pool) = setup();
        let token = register(&registry);

        registry.save_handler_mapping(HandlerId(10), token);
        registry.save_source_mapping(SourceId(10), token);

        registry.remove_callback_by_handler(HandlerId(10));
        assert!(registry.contains(token));
        assert!(registry.has_callback_mappings(token));

        registry.remove_callback_by_source(SourceId(10));
        assert!(!registry.contains(token));
    }

    #[test]
    fn test_double_removal_is_noop() {
        let (registry, pool) = setup();
        let keep = register(&registry);
        let token = register(&registry);
        registry.save_handler_mapping(HandlerId(4), keep);
        registry.save_handler_mapping(HandlerId(7), token);

        assert!(registry.remove_callback_by_handler(HandlerId(7)));
        assert!(!registry.remove_callback_by_handler(HandlerId(7)));
        assert!(!registry.remove_callback_by_handler(HandlerId(999)));

        assert_eq!(registry.ref_count(keep), 2);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_save_for_unregistered_token_is_ignored() {
        let (registry, _pool) = setup();
        let token = register(&registry);
        registry.remove(token);

        registry.save_handler_mapping(HandlerId(1), token);
        assert_eq!(registry.handler_count(), 0);
    }

    #[test]
    fn test_refused_pin_evicts_fresh_registration() {
        let (registry, pool) = setup();
        let closure = Closure::new(|_| 0);

        let (token, _) = registry.pin(&closure).unwrap();
        assert_eq!(registry.ref_count(token), 2);
        registry.commit_handler_pin(HandlerId::INVALID, token);

        assert!(!registry.contains(token));
        assert!(registry.token_for(&closure).is_none());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_refused_pin_keeps_explicit_registration() {
        let (registry, _pool) = setup();
        let closure = Closure::new(|_| 0);
        let token = registry.register(Some(&closure)).unwrap().unwrap();

        let (pinned, _) = registry.pin(&closure).unwrap();
        assert_eq!(pinned, token);
        registry.commit_source_pin(SourceId::INVALID, token);

        assert!(registry.contains(token));
        assert_eq!(registry.ref_count(token), 1);
    }

    #[test]
    fn test_last_mapping_removed_while_pinned() {
        let (registry, pool) = setup();
        let closure = Closure::new(|_| 0);
        let (token, address) = registry.pin(&closure).unwrap();
        registry.commit_handler_pin(HandlerId(1), token);

        let (pinned, pinned_address) = registry.pin(&closure).unwrap();
        assert_eq!((pinned, pinned_address), (token, address));
        assert!(registry.remove_callback_by_handler(HandlerId(1)));
        assert!(registry.contains(token));
        assert_eq!(pool.in_use(), 1);

        registry.commit_handler_pin(HandlerId(2), token);
        assert_eq!(registry.ref_count(token), 2);
        assert_eq!(registry.lookup(token), Some(address));

        registry.remove_callback_by_handler(HandlerId(2));
        assert!(!registry.contains(token));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_last_mapping_removed_then_pin_refused() {
        let (registry, pool) = setup();
        let closure = Closure::new(|_| 0);
        let (token, _) = registry.pin(&closure).unwrap();
        registry.commit_source_pin(SourceId(1), token);

        registry.pin(&closure).unwrap();
        registry.remove_callback_by_source(SourceId(1));
        registry.commit_source_pin(SourceId::INVALID, token);

        assert!(!registry.contains(token));
        assert_eq!(pool.in_use(), 0);
    }
}

