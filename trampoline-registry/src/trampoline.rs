//! Source trampoline multiplexer
//!
//! Idle and timeout callbacks are short-lived and can be scheduled without
//! bound, while native slots are a small fixed pool. Instead of one slot per
//! source, every source goes through one of two shared entry points:
//!
//! * the repeating entry (`fn(user_data) -> keep`), for ordinary sources
//! * the one-shot entry (`fn(user_data)`), for sources that fire once
//!
//! The user data is a [`DispatchId`] into a table of registered closures.
//! Dispatch ids only ever increase, so an id is never reused while an older
//! registration with that id could still be delivered.

use crate::slots::SlotProvider;
use crate::types::{Closure, DispatchId, NativeAddress, Result, SourceAction, SourceId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Callback run by a repeating source
pub type SourceFunc = Arc<dyn Fn() -> SourceAction + Send + Sync>;

/// Which shared entry point a source is registered under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Repeating,
    OneShot,
}

struct SourceEntry {
    func: SourceFunc,
    kind: DispatchKind,
    /// Native source id, once the scheduler has returned it
    source: Option<SourceId>,
}

struct TrampolineState {
    next_id: u64,
    funcs: HashMap<DispatchId, SourceEntry>,
    source_to_dispatch: HashMap<SourceId, DispatchId>,
}

impl TrampolineState {
    /// Remove an entry together with its reverse source mapping
    fn take(&mut self, id: DispatchId) -> Option<SourceEntry> {
        let entry = self.funcs.remove(&id)?;
        if let Some(source) = entry.source {
            if self.source_to_dispatch.get(&source) == Some(&id) {
                self.source_to_dispatch.remove(&source);
            }
        }
        Some(entry)
    }
}

/// Dispatch table shared with the two entry-point closures
struct DispatchTable {
    state: Mutex<TrampolineState>,
}

impl DispatchTable {
    fn dispatch(&self, id: DispatchId) -> SourceAction {
        let func = {
            let state = self.state.lock();
            match state.funcs.get(&id) {
                Some(entry) => entry.func.clone(),
                None => {
                    // Already removed, e.g. by remove_source before this delivery.
                    log::trace!("Dispatch {} has no entry, stopping", id.get());
                    return SourceAction::Remove;
                }
            }
        };

        let action = func();
        if action == SourceAction::Remove {
            self.state.lock().take(id);
        }
        action
    }

    fn dispatch_once(&self, id: DispatchId) {
        // Removed before the call: a second delivery of the same id finds nothing.
        let entry = self.state.lock().take(id);
        match entry {
            Some(entry) => {
                (entry.func)();
            }
            None => log::trace!("One-shot dispatch {} has no entry", id.get()),
        }
    }
}

/// Multiplexes event-loop sources over two shared native slots
pub struct SourceTrampolines {
    table: Arc<DispatchTable>,
    provider: Arc<dyn SlotProvider>,
    repeating_entry: NativeAddress,
    once_entry: NativeAddress,
}

impl SourceTrampolines {
    /// Allocate and install the two shared entry points.
    ///
    /// This consumes two slots from `provider` for the lifetime of the
    /// returned value.
    pub fn install(provider: Arc<dyn SlotProvider>) -> Result<Self> {
        let table = Arc::new(DispatchTable {
            state: Mutex::new(TrampolineState {
                next_id: 0,
                funcs: HashMap::new(),
                source_to_dispatch: HashMap::new(),
            }),
        });

        let weak: Weak<DispatchTable> = Arc::downgrade(&table);
        let repeating_entry = provider.allocate(Closure::new(move |args| {
            let id = DispatchId::from_user_data(args.first().copied().unwrap_or(0));
            match weak.upgrade() {
                Some(table) => table.dispatch(id).to_native(),
                None => SourceAction::Remove.to_native(),
            }
        }))?;

        let weak: Weak<DispatchTable> = Arc::downgrade(&table);
        let once_entry = match provider.allocate(Closure::new(move |args| {
            let id = DispatchId::from_user_data(args.first().copied().unwrap_or(0));
            if let Some(table) = weak.upgrade() {
                table.dispatch_once(id);
            }
            0
        })) {
            Ok(address) => address,
            Err(err) => {
                provider.release(repeating_entry);
                return Err(err);
            }
        };

        log::debug!(
            "Installed source trampolines (repeating: {}, once: {})",
            repeating_entry,
            once_entry
        );
        Ok(Self {
            table,
            provider,
            repeating_entry,
            once_entry,
        })
    }

    /// Addresses of the (repeating, one-shot) entry points
    pub fn entry_points(&self) -> (NativeAddress, NativeAddress) {
        (self.repeating_entry, self.once_entry)
    }

    /// Entry point matching `kind`
    pub fn entry_point(&self, kind: DispatchKind) -> NativeAddress {
        match kind {
            DispatchKind::Repeating => self.repeating_entry,
            DispatchKind::OneShot => self.once_entry,
        }
    }

    /// Store a source callback and return the entry point and user data to
    /// hand to the native scheduler.
    ///
    /// `None` registers nothing (the native side gets a null callback).
    pub fn register_source_func(
        &self,
        func: Option<SourceFunc>,
        once: bool,
    ) -> Option<(NativeAddress, DispatchId)> {
        let kind = if once {
            DispatchKind::OneShot
        } else {
            DispatchKind::Repeating
        };
        func.map(|func| self.register(func, kind))
    }

    /// Store a single-invocation callback under the one-shot entry point.
    ///
    /// The callback is wrapped into the repeating shape and always reports
    /// [`SourceAction::Remove`]; it can run at most once however often the
    /// wrapper is called.
    pub fn register_source_once_func<F>(&self, func: Option<F>) -> Option<(NativeAddress, DispatchId)>
    where
        F: FnOnce() + Send + 'static,
    {
        let func = func?;
        let cell = Mutex::new(Some(func));
        let wrapped: SourceFunc = Arc::new(move || {
            if let Some(func) = cell.lock().take() {
                func();
            }
            SourceAction::Remove
        });
        Some(self.register(wrapped, DispatchKind::OneShot))
    }

    pub(crate) fn register(&self, func: SourceFunc, kind: DispatchKind) -> (NativeAddress, DispatchId) {
        let mut state = self.table.state.lock();
        state.next_id += 1;
        let id = DispatchId(state.next_id);
        state.funcs.insert(
            id,
            SourceEntry {
                func,
                kind,
                source: None,
            },
        );
        log::trace!("Registered {:?} source dispatch {}", kind, id.get());
        (self.entry_point(kind), id)
    }

    /// Record the native source id a dispatch id was scheduled under.
    ///
    /// Id 0 is ignored. If the dispatch entry is already gone (a one-shot
    /// source can fire before its id is known here) nothing is recorded.
    pub fn save_source_trampoline_mapping(&self, source: SourceId, id: DispatchId) {
        if !source.is_valid() {
            return;
        }

        let mut state = self.table.state.lock();
        let Some(entry) = state.funcs.get_mut(&id) else {
            log::trace!("Dispatch {} finished before {} was recorded", id.get(), source);
            return;
        };
        entry.source = Some(source);
        state.source_to_dispatch.insert(source, id);
    }

    /// Purge the dispatch entry behind a native source id.
    ///
    /// Any delivery for it that is already scheduled becomes a no-op. Returns
    /// false if nothing was registered for `source`.
    pub fn remove_source_trampoline_by_source_id(&self, source: SourceId) -> bool {
        let mut state = self.table.state.lock();
        match state.source_to_dispatch.remove(&source) {
            Some(id) => {
                state.funcs.remove(&id);
                log::trace!("Purged dispatch {} for {}", id.get(), source);
                true
            }
            None => false,
        }
    }

    /// Drop a registration that never reached the native scheduler
    pub fn discard(&self, id: DispatchId) {
        self.table.state.lock().take(id);
    }

    /// Run the repeating entry point's dispatch for `id`
    pub fn dispatch_repeating(&self, id: DispatchId) -> SourceAction {
        self.table.dispatch(id)
    }

    /// Run the one-shot entry point's dispatch for `id`
    pub fn dispatch_once(&self, id: DispatchId) {
        self.table.dispatch_once(id)
    }

    /// Whether a dispatch id is still registered
    pub fn is_registered(&self, id: DispatchId) -> bool {
        self.table.state.lock().funcs.contains_key(&id)
    }

    /// Kind of a registered dispatch id
    pub fn kind_of(&self, id: DispatchId) -> Option<DispatchKind> {
        self.table.state.lock().funcs.get(&id).map(|entry| entry.kind)
    }

    /// Number of registered, not yet finished sources
    pub fn outstanding(&self) -> usize {
        self.table.state.lock().funcs.len()
    }

    /// Drop every registered source
    pub fn clear(&self) {
        let mut state = self.table.state.lock();
        state.funcs.clear();
        state.source_to_dispatch.clear();
    }
}

impl Drop for SourceTrampolines {
    fn drop(&mut self) {
        self.clear();
        self.provider.release(self.repeating_entry);
        self.provider.release(self.once_entry);
    }
}
