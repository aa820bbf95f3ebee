//! Bridge service
//!
//! One explicitly constructed object owns the callback registry, the source
//! multiplexer and the native collaborators. Construction installs the two
//! shared source entry points; dropping the bridge releases them and every
//! slot still held by the registry. Independent bridges share nothing.

use crate::arena::Token;
use crate::callbacks::CallbackRegistry;
use crate::config::BridgeConfig;
use crate::native::{NativeMainLoop, NativeSignals, SimulatedRuntime, SourceKind};
use crate::signals::SignalManager;
use crate::slots::{SlotPool, SlotProvider};
use crate::trampoline::{DispatchKind, SourceFunc, SourceTrampolines};
use crate::types::{
    Closure, DispatchId, HandlerId, NativeAddress, ObjectHandle, Result, SourceAction, SourceId,
};
use serde::Serialize;
use std::sync::Arc;

/// Snapshot of the bridge's bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Closures currently holding a registry slot
    pub live_callbacks: usize,
    /// Live signal handler mappings
    pub handler_mappings: usize,
    /// Live callback-backed source mappings
    pub source_mappings: usize,
    /// Multiplexed sources registered and not yet finished
    pub outstanding_sources: usize,
    /// Slots consumed in the provider (entry points included)
    pub slots_in_use: usize,
    /// Provider limit
    pub slot_limit: usize,
}

/// Bridges managed closures to native signals and event-loop sources
pub struct Bridge {
    config: BridgeConfig,
    provider: Arc<dyn SlotProvider>,
    callbacks: Arc<CallbackRegistry>,
    sources: SourceTrampolines,
    signals: SignalManager,
    main_loop: Arc<dyn NativeMainLoop>,
}

impl Bridge {
    /// Construct a bridge and install the shared source entry points.
    ///
    /// # Errors
    /// * `Config` if `config` is invalid
    /// * `SlotsExhausted` if the provider cannot spare the two entry-point slots
    pub fn new(
        config: BridgeConfig,
        provider: Arc<dyn SlotProvider>,
        signals: Arc<dyn NativeSignals>,
        main_loop: Arc<dyn NativeMainLoop>,
    ) -> Result<Self> {
        config.validate()?;
        let callbacks = Arc::new(CallbackRegistry::new(provider.clone()));
        let sources = SourceTrampolines::install(provider.clone())?;
        let signals = SignalManager::new(callbacks.clone(), signals);

        log::info!(
            "Bridge initialized (slot limit: {}, reclaim: {})",
            provider.limit(),
            provider.supports_release()
        );
        Ok(Self {
            config,
            provider,
            callbacks,
            sources,
            signals,
            main_loop,
        })
    }

    /// Construct a bridge on an in-process slot pool and simulated runtime
    pub fn simulated(config: BridgeConfig) -> Result<(Self, Arc<SimulatedRuntime>)> {
        let pool: Arc<dyn SlotProvider> = Arc::new(SlotPool::new(&config)?);
        let runtime = Arc::new(SimulatedRuntime::new(pool.clone()));
        let bridge = Self::new(config, pool, runtime.clone(), runtime.clone())?;
        Ok((bridge, runtime))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub fn sources(&self) -> &SourceTrampolines {
        &self.sources
    }

    pub fn provider(&self) -> &Arc<dyn SlotProvider> {
        &self.provider
    }

    // ----- Callback registry -----

    /// Promote a closure to a native slot (idempotent per closure)
    pub fn register_callback(&self, closure: Option<&Closure>) -> Result<Option<Token>> {
        self.callbacks.register(closure)
    }

    pub fn lookup_callback(&self, token: Token) -> Option<NativeAddress> {
        self.callbacks.lookup(token)
    }

    /// Drop a registration and release its slot.
    ///
    /// On providers without slot reclamation this frees nothing in the pool.
    pub fn remove_callback(&self, token: Token) {
        self.callbacks.remove(token)
    }

    // ----- Signals -----

    /// Connect `closure` to `signal` on `object`; see [`SignalManager::connect`]
    pub fn connect_signal(&self, object: ObjectHandle, signal: &str, closure: &Closure) -> Result<HandlerId> {
        self.signals.connect(object, signal, closure)
    }

    pub fn disconnect_signal(&self, object: ObjectHandle, handler: HandlerId) {
        self.signals.disconnect(object, handler)
    }

    // ----- Event-loop sources -----

    /// Schedule a repeating source. `func` runs until it returns
    /// [`SourceAction::Remove`] or the source is removed.
    ///
    /// Returns [`SourceId::INVALID`] if the scheduler refused the source.
    pub fn add_repeating_source<F>(&self, kind: SourceKind, func: F) -> Result<SourceId>
    where
        F: Fn() -> SourceAction + Send + Sync + 'static,
    {
        let func: SourceFunc = Arc::new(func);
        let (entry, dispatch) = self.sources.register(func, DispatchKind::Repeating);
        let source = self.main_loop.add_source(kind, entry, dispatch.as_user_data());
        self.finish_source_registration(source, dispatch);
        Ok(source)
    }

    /// Schedule a source that runs `func` exactly once
    pub fn add_once_source<F>(&self, kind: SourceKind, func: F) -> Result<SourceId>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some((entry, dispatch)) = self.sources.register_source_once_func(Some(func)) else {
            return Ok(SourceId::INVALID);
        };
        let source = self.main_loop.add_source_once(kind, entry, dispatch.as_user_data());
        self.finish_source_registration(source, dispatch);
        Ok(source)
    }

    /// Schedule a source whose callback is a dedicated slot bound to `closure`.
    ///
    /// The closure follows the repeating convention (`0` = remove) and is kept
    /// alive until [`Bridge::remove_source`] is called for the returned id,
    /// even if it also backs signal handlers.
    pub fn add_callback_source(&self, kind: SourceKind, closure: &Closure) -> Result<SourceId> {
        let (token, address) = self.callbacks.pin(closure)?;
        let source = self.main_loop.add_source(kind, address, 0);
        self.callbacks.commit_source_pin(source, token);
        Ok(source)
    }

    /// Unschedule a source and release whatever the bridge holds for it.
    ///
    /// Safe to call for a source that already fired or was already removed.
    /// Returns whether the native scheduler still had the source.
    pub fn remove_source(&self, source: SourceId) -> bool {
        let scheduled = self.main_loop.remove_source(source);
        self.sources.remove_source_trampoline_by_source_id(source);
        self.callbacks.remove_callback_by_source(source);
        scheduled
    }

    /// Repeating source that runs on every main-loop iteration
    pub fn idle_add<F>(&self, func: F) -> Result<SourceId>
    where
        F: Fn() -> SourceAction + Send + Sync + 'static,
    {
        self.add_repeating_source(SourceKind::Idle, func)
    }

    /// One-shot source for the next main-loop iteration
    pub fn idle_add_once<F>(&self, func: F) -> Result<SourceId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_once_source(SourceKind::Idle, func)
    }

    /// Repeating source that runs every `interval_ms`
    pub fn timeout_add<F>(&self, interval_ms: u32, func: F) -> Result<SourceId>
    where
        F: Fn() -> SourceAction + Send + Sync + 'static,
    {
        self.add_repeating_source(SourceKind::Timeout { interval_ms }, func)
    }

    /// One-shot source that runs after `interval_ms`
    pub fn timeout_add_once<F>(&self, interval_ms: u32, func: F) -> Result<SourceId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_once_source(SourceKind::Timeout { interval_ms }, func)
    }

    /// Bookkeeping snapshot
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            live_callbacks: self.callbacks.len(),
            handler_mappings: self.callbacks.handler_count(),
            source_mappings: self.callbacks.source_count(),
            outstanding_sources: self.sources.outstanding(),
            slots_in_use: self.provider.in_use(),
            slot_limit: self.provider.limit(),
        }
    }

    /// Tear the bridge down; equivalent to dropping it
    pub fn shutdown(self) {}

    fn finish_source_registration(&self, source: SourceId, dispatch: DispatchId) {
        if source.is_valid() {
            self.sources.save_source_trampoline_mapping(source, dispatch);
        } else {
            log::debug!("Scheduler refused source for dispatch {}", dispatch.get());
            self.sources.discard(dispatch);
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let stats = self.stats();
        log::debug!(
            "Shutting down bridge ({} callbacks, {} sources outstanding)",
            stats.live_callbacks,
            stats.outstanding_sources
        );
        self.callbacks.clear();
        // `sources` releases the entry points when it is dropped right after.
    }
}
