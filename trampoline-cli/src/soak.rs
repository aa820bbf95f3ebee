//! Soak workload
//!
//! Drives a bridge on the simulated runtime through a connect/schedule/run/
//! teardown cycle from several threads and records how much of the slot pool
//! it consumed along the way.

use crate::config::{AppConfig, WorkloadConfig};
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use trampoline_registry::{
    Bridge, BridgeStats, Closure, HandlerId, ObjectHandle, PoolStats, SimulatedRuntime, SlotPool,
    SourceAction, SourceId, SourceKind,
};

/// First simulated object handle; objects are spaced one word apart
const OBJECT_BASE: usize = 0x10_0000;

/// Outcome of one soak run
#[derive(Debug, Clone, Serialize)]
pub struct SoakReport {
    pub slot_limit: usize,
    pub reclaim_slots: bool,
    pub threads: usize,
    pub signal_connections: usize,
    pub refused_connections: usize,
    pub sources_scheduled: usize,
    pub signal_invocations: usize,
    pub source_invocations: usize,
    /// Bridge state right after everything was connected and scheduled
    pub loaded: BridgeStats,
    /// Bridge state after every connection and source was torn down
    pub after_teardown: BridgeStats,
    pub pool: PoolStats,
    pub elapsed_ms: u64,
}

impl SoakReport {
    /// Slots still consumed after teardown beyond the two entry points
    pub fn leaked_slots(&self) -> usize {
        self.after_teardown.slots_in_use.saturating_sub(2)
    }

    /// Whether teardown left no registry state behind.
    ///
    /// Without reclaim, released slots stay consumed; that alone does not
    /// make a run dirty.
    pub fn is_clean(&self) -> bool {
        let state = &self.after_teardown;
        let registry_empty = state.live_callbacks == 0
            && state.handler_mappings == 0
            && state.source_mappings == 0
            && state.outstanding_sources == 0;
        registry_empty && (!self.reclaim_slots || self.leaked_slots() == 0)
    }
}

struct Counters {
    signals: AtomicUsize,
    sources: AtomicUsize,
}

/// Run the configured workload against a fresh simulated bridge
pub fn run(config: &AppConfig) -> Result<SoakReport> {
    let workload = &config.workload;
    let started = Instant::now();

    let pool = Arc::new(SlotPool::new(&config.bridge)?);
    let runtime = Arc::new(SimulatedRuntime::new(pool.clone()));
    let bridge = Bridge::new(config.bridge.clone(), pool.clone(), runtime.clone(), runtime.clone())?;

    let workers = rayon::ThreadPoolBuilder::new()
        .num_threads(workload.threads)
        .build()
        .context("Failed to start worker threads")?;

    let counters = Arc::new(Counters {
        signals: AtomicUsize::new(0),
        sources: AtomicUsize::new(0),
    });
    let shared = shared_closures(workload, &counters);

    log::info!(
        "Connecting {} signals on {} objects using {} shared closures",
        workload.signals.len(),
        workload.objects,
        shared.len()
    );
    let handlers = workers.install(|| connect_all(&bridge, workload, &shared))?;
    let refused_connections = handlers.iter().filter(|(_, handler)| !handler.is_valid()).count();

    log::info!("Scheduling sources on {} threads", workload.threads);
    let sources = workers.install(|| schedule_all(&bridge, workload, &shared, &counters))?;
    let loaded = bridge.stats();
    log::debug!("Loaded state: {:?}", loaded);

    for iteration in 0..workload.iterations {
        runtime.advance(workload.tick_ms);
        for object in 0..workload.objects {
            for signal in &workload.signals {
                runtime.emit(object_handle(object), signal, &[iteration]);
            }
        }
    }
    log::debug!(
        "Ran {} iterations, {} sources still pending",
        workload.iterations,
        runtime.pending_sources()
    );

    workers.install(|| {
        handlers
            .par_iter()
            .filter(|(_, handler)| handler.is_valid())
            .for_each(|(object, handler)| bridge.disconnect_signal(*object, *handler));
        sources.par_iter().for_each(|source| {
            bridge.remove_source(*source);
        });
    });
    let after_teardown = bridge.stats();

    let report = SoakReport {
        slot_limit: bridge.config().slot_limit,
        reclaim_slots: bridge.config().reclaim_slots,
        threads: workload.threads,
        signal_connections: handlers.len() - refused_connections,
        refused_connections,
        sources_scheduled: sources.len() + workload.once_sources,
        signal_invocations: counters.signals.load(Ordering::SeqCst),
        source_invocations: counters.sources.load(Ordering::SeqCst),
        loaded,
        after_teardown,
        pool: pool.stats(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    };

    bridge.shutdown();
    Ok(report)
}

fn object_handle(index: usize) -> ObjectHandle {
    ObjectHandle(OBJECT_BASE + index * std::mem::size_of::<usize>())
}

fn shared_closures(workload: &WorkloadConfig, counters: &Arc<Counters>) -> Vec<Closure> {
    (0..workload.shared_closures)
        .map(|_| {
            let counters = counters.clone();
            Closure::new(move |_| {
                counters.signals.fetch_add(1, Ordering::Relaxed);
                0
            })
        })
        .collect()
}

/// Connect every signal on every object, spreading the shared closures
fn connect_all(
    bridge: &Bridge,
    workload: &WorkloadConfig,
    shared: &[Closure],
) -> Result<Vec<(ObjectHandle, HandlerId)>> {
    let per_object = workload.signals.len();
    let connections = (0..workload.objects)
        .into_par_iter()
        .map(|object| {
            let handle = object_handle(object);
            workload
                .signals
                .iter()
                .enumerate()
                .map(|(i, signal)| {
                    let closure = &shared[(object * per_object + i) % shared.len()];
                    bridge
                        .connect_signal(handle, signal, closure)
                        .map(|handler| (handle, handler))
                })
                .collect::<trampoline_registry::Result<Vec<_>>>()
        })
        .collect::<trampoline_registry::Result<Vec<_>>>()?;
    Ok(connections.into_iter().flatten().collect())
}

/// Schedule all sources. Returns the ids that need removing at teardown;
/// one-shot sources clean up after themselves.
fn schedule_all(
    bridge: &Bridge,
    workload: &WorkloadConfig,
    shared: &[Closure],
    counters: &Arc<Counters>,
) -> Result<Vec<SourceId>> {
    (0..workload.once_sources)
        .into_par_iter()
        .try_for_each(|i| {
            let counters = counters.clone();
            let func = move || {
                counters.sources.fetch_add(1, Ordering::Relaxed);
            };
            let kind = if i % 2 == 0 {
                SourceKind::Idle
            } else {
                SourceKind::Timeout {
                    interval_ms: workload.timeout_interval_ms,
                }
            };
            bridge.add_once_source(kind, func).map(|_| ())
        })?;

    let timeout = SourceKind::Timeout {
        interval_ms: workload.timeout_interval_ms,
    };
    let repeating = (0..workload.idle_sources + workload.timeout_sources)
        .into_par_iter()
        .map(|i| {
            let kind = if i < workload.idle_sources {
                SourceKind::Idle
            } else {
                timeout
            };
            let counters = counters.clone();
            let runs = AtomicUsize::new(0);
            let repeats = workload.source_repeats;
            bridge.add_repeating_source(kind, move || {
                counters.sources.fetch_add(1, Ordering::Relaxed);
                if runs.fetch_add(1, Ordering::Relaxed) + 1 < repeats {
                    SourceAction::Continue
                } else {
                    SourceAction::Remove
                }
            })
        })
        .collect::<trampoline_registry::Result<Vec<_>>>()?;

    let mut backed = Vec::with_capacity(workload.callback_sources);
    for i in 0..workload.callback_sources {
        let closure = &shared[i % shared.len()];
        backed.push(bridge.add_callback_source(SourceKind::Idle, closure)?);
    }

    Ok(repeating.into_iter().chain(backed).collect())
}
