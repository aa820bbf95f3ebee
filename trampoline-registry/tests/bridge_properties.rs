//! End-to-end behavior of a bridge running on the simulated runtime

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use trampoline_registry::{
    Bridge, BridgeConfig, BridgeError, Closure, DispatchId, HandlerId, ObjectHandle,
    SimulatedRuntime, SlotProvider, SourceAction, SourceId, SourceKind,
};

fn bridge(limit: usize) -> (Bridge, Arc<SimulatedRuntime>) {
    let _ = env_logger::builder().is_test(true).try_init();
    Bridge::simulated(
        BridgeConfig::new()
            .with_reclaim_slots(true)
            .with_slot_limit(limit),
    )
    .unwrap()
}

fn counter() -> (Arc<AtomicUsize>, Closure) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let closure = Closure::new(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        0
    });
    (count, closure)
}

#[test]
fn test_closure_shared_by_two_signals() {
    let (bridge, runtime) = bridge(16);
    let (count, closure) = counter();
    let entry = ObjectHandle(0x100);

    let changed = bridge.connect_signal(entry, "changed", &closure).unwrap();
    let activate = bridge.connect_signal(entry, "activate", &closure).unwrap();
    assert!(changed.is_valid() && activate.is_valid());
    assert_ne!(changed, activate);

    let token = bridge.callbacks().token_for(&closure).unwrap();
    let address = bridge.lookup_callback(token).unwrap();
    assert_eq!(bridge.callbacks().handler_token(changed), Some(token));
    assert_eq!(bridge.callbacks().handler_token(activate), Some(token));
    // Entry points plus one slot for the closure
    assert_eq!(bridge.stats().slots_in_use, 3);

    runtime.emit(entry, "changed", &[]);
    runtime.emit(entry, "activate", &[]);
    assert_eq!(count.load(Ordering::SeqCst), 2);

    bridge.disconnect_signal(entry, changed);
    assert_eq!(bridge.lookup_callback(token), Some(address));
    bridge.disconnect_signal(entry, activate);
    assert_eq!(bridge.lookup_callback(token), None);
    assert_eq!(bridge.stats().slots_in_use, 2);
}

#[test]
fn test_mapping_ref_counts_are_symmetric() {
    let (bridge, _runtime) = bridge(32);
    let object = ObjectHandle(1);
    let closures: Vec<Closure> = (0..4).map(|_| Closure::new(|_| 0)).collect();

    let mut handlers = Vec::new();
    for (i, closure) in closures.iter().enumerate() {
        for signal in ["a", "b", "c"].iter().take(i + 1) {
            handlers.push(bridge.connect_signal(object, signal, closure).unwrap());
        }
    }
    assert_eq!(bridge.stats().live_callbacks, 4);
    assert_eq!(bridge.stats().handler_mappings, handlers.len());

    // Disconnect in an order unrelated to connection order
    handlers.reverse();
    handlers.rotate_left(3);
    for handler in handlers {
        bridge.disconnect_signal(object, handler);
    }

    let stats = bridge.stats();
    assert_eq!(stats.live_callbacks, 0);
    assert_eq!(stats.handler_mappings, 0);
    assert_eq!(stats.slots_in_use, 2);
}

#[test]
fn test_once_source_runs_exactly_once_on_redelivery() {
    let (bridge, runtime) = bridge(16);
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let source = bridge
        .idle_add_once(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let delivery = runtime.pending_delivery(source).unwrap();
    assert_eq!(delivery.callback, bridge.sources().entry_points().1);

    runtime.run_until_idle(10);
    // A stale duplicate delivery of the same dispatch id
    runtime.deliver(delivery);

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(bridge.stats().outstanding_sources, 0);
}

#[test]
fn test_removed_source_never_runs() {
    let (bridge, runtime) = bridge(16);
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let source = bridge
        .timeout_add(5, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            SourceAction::Continue
        })
        .unwrap();

    let delivery = runtime.pending_delivery(source).unwrap();
    assert!(bridge.remove_source(source));

    // Already in flight when the source was removed
    assert_eq!(
        runtime.deliver(delivery),
        Some(SourceAction::Remove.to_native())
    );
    runtime.advance(100);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stale_dispatch_id_is_not_reused() {
    let (bridge, runtime) = bridge(16);
    let first = bridge.idle_add_once(|| {}).unwrap();
    let stale = runtime.pending_delivery(first).unwrap();
    runtime.run_until_idle(10);

    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let second = bridge
        .idle_add_once(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let fresh = runtime.pending_delivery(second).unwrap();
    assert_ne!(
        DispatchId::from_user_data(stale.user_data),
        DispatchId::from_user_data(fresh.user_data)
    );

    runtime.deliver(stale);
    assert_eq!(count.load(Ordering::SeqCst), 0);
    runtime.run_until_idle(10);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_disconnect_is_idempotent() {
    let (bridge, runtime) = bridge(16);
    let object = ObjectHandle(9);
    let keep = bridge
        .connect_signal(object, "notify", &Closure::new(|_| 0))
        .unwrap();
    let handler = bridge
        .connect_signal(object, "destroy", &Closure::new(|_| 0))
        .unwrap();

    bridge.disconnect_signal(object, handler);
    bridge.disconnect_signal(object, handler);
    bridge.disconnect_signal(object, HandlerId::INVALID);
    bridge.disconnect_signal(object, HandlerId(12345));

    assert_eq!(runtime.connection_count(), 1);
    assert!(bridge.callbacks().handler_token(keep).is_some());
    assert_eq!(bridge.stats().live_callbacks, 1);
}

#[test]
fn test_closure_backing_signal_and_source() {
    let (bridge, runtime) = bridge(16);
    let (count, closure) = counter();
    let object = ObjectHandle(3);

    let handler = bridge.connect_signal(object, "clicked", &closure).unwrap();
    let source = bridge.add_callback_source(SourceKind::Idle, &closure).unwrap();
    let token = bridge.callbacks().token_for(&closure).unwrap();
    assert_eq!(bridge.callbacks().ref_count(token), 3);
    assert_eq!(bridge.stats().slots_in_use, 3);

    runtime.iterate();
    runtime.emit(object, "clicked", &[]);
    assert_eq!(count.load(Ordering::SeqCst), 2);

    bridge.disconnect_signal(object, handler);
    assert!(bridge.callbacks().contains(token));
    bridge.remove_source(source);
    assert!(!bridge.callbacks().contains(token));
    assert_eq!(bridge.stats().slots_in_use, 2);
}

#[test]
fn test_exhaustion_is_reported() {
    let (bridge, _runtime) = bridge(4);
    let object = ObjectHandle(1);
    bridge
        .connect_signal(object, "a", &Closure::new(|_| 0))
        .unwrap();
    bridge
        .connect_signal(object, "b", &Closure::new(|_| 0))
        .unwrap();

    let result = bridge.connect_signal(object, "c", &Closure::new(|_| 0));
    assert!(matches!(result, Err(BridgeError::SlotsExhausted { limit: 4 })));

    // Multiplexed sources need no slot of their own
    let source = bridge.idle_add(|| SourceAction::Remove).unwrap();
    assert!(source.is_valid());
}

#[test]
fn test_released_slots_stay_consumed_without_reclaim() {
    let (bridge, runtime) = Bridge::simulated(
        BridgeConfig::new()
            .with_reclaim_slots(false)
            .with_slot_limit(4),
    )
    .unwrap();
    let object = ObjectHandle(1);
    let (count, closure) = counter();

    let handler = bridge.connect_signal(object, "clicked", &closure).unwrap();
    let token = bridge.callbacks().handler_token(handler).unwrap();
    let address = bridge.lookup_callback(token).unwrap();
    bridge.disconnect_signal(object, handler);

    let stats = bridge.stats();
    assert_eq!(stats.live_callbacks, 0);
    assert_eq!(stats.slots_in_use, 3);

    // The released slot is unbound even though it is not reused
    assert_eq!(bridge.provider().invoke(address, &[]), None);
    assert_eq!(runtime.emit(object, "clicked", &[]), 0);
    assert_eq!(count.load(Ordering::SeqCst), 0);

    bridge
        .connect_signal(object, "clicked", &Closure::new(|_| 0))
        .unwrap();
    let result = bridge.connect_signal(object, "clicked", &Closure::new(|_| 0));
    assert!(matches!(result, Err(BridgeError::SlotsExhausted { .. })));
}

#[test]
fn test_many_sources_use_no_extra_slots() {
    let (bridge, runtime) = bridge(8);
    let count = Arc::new(AtomicUsize::new(0));

    for i in 0..5000u32 {
        let seen = count.clone();
        if i % 2 == 0 {
            bridge
                .idle_add_once(move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        } else {
            bridge
                .timeout_add_once(i % 7, move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
    }
    assert_eq!(bridge.stats().slots_in_use, 2);
    assert_eq!(bridge.stats().outstanding_sources, 5000);

    runtime.advance(10);
    runtime.run_until_idle(10);
    assert_eq!(count.load(Ordering::SeqCst), 5000);
    assert_eq!(bridge.stats().outstanding_sources, 0);
    assert_eq!(bridge.stats().slots_in_use, 2);
}

#[test]
fn test_concurrent_registration() {
    let (bridge, runtime) = bridge(64);
    let shared = Closure::new(|_| 0);
    let count = Arc::new(AtomicUsize::new(0));
    let object = ObjectHandle(0x42);

    let handlers: Vec<HandlerId> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let bridge = &bridge;
                let shared = &shared;
                let count = count.clone();
                scope.spawn(move || {
                    let mut handlers = Vec::new();
                    for _ in 0..50 {
                        handlers.push(bridge.connect_signal(object, "tick", shared).unwrap());
                        let seen = count.clone();
                        bridge
                            .idle_add_once(move || {
                                seen.fetch_add(1, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                    handlers
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect()
    });

    // One closure, one slot, however many threads connected it
    assert_eq!(bridge.stats().live_callbacks, 1);
    assert_eq!(bridge.stats().slots_in_use, 3);
    assert_eq!(bridge.stats().handler_mappings, 400);

    runtime.run_until_idle(10);
    assert_eq!(count.load(Ordering::SeqCst), 400);

    for handler in handlers {
        bridge.disconnect_signal(object, handler);
    }
    assert_eq!(bridge.stats().live_callbacks, 0);
    assert_eq!(bridge.stats().slots_in_use, 2);
}

#[test]
fn test_removed_repeating_source_leaves_nothing_behind() {
    let (bridge, runtime) = bridge(16);
    let source = bridge.idle_add(|| SourceAction::Continue).unwrap();
    assert!(bridge.remove_source(source));
    assert!(!bridge.remove_source(SourceId::INVALID));

    assert_eq!(runtime.pending_sources(), 0);
    assert_eq!(bridge.stats().outstanding_sources, 0);
}
