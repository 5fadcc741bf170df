//! Allocation strategies, frees and teardown on a simulated device

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Fixture, HostMirror};
use rocm_devcache::backend::{DeviceError, DeviceResult};
use rocm_devcache::memory::{MemoryOp, MemoryStatsSink};
use rocm_devcache::{
    AllocatorConfig, DeviceFootprint, DeviceMemoryError, DeviceMemoryManager, DevicePtr,
    SimulatedDevice,
};

#[test]
fn test_reuse_does_not_allocate_fresh() {
    let fx = Fixture::new(1 << 20);
    let ptr = fx.manager.malloc("matmul", 4096).unwrap();
    fx.manager.free("matmul", ptr, false).unwrap();
    let fresh_before = fx.manager.counters().fresh_allocations();
    let device_calls_before = fx.device.allocate_calls().unwrap();

    let again = fx.manager.malloc("matmul", 4096).unwrap();

    assert_eq!(again, ptr);
    assert_eq!(fx.manager.counters().fresh_allocations(), fresh_before);
    assert_eq!(fx.device.allocate_calls().unwrap(), device_calls_before);
    fx.assert_accounting();
}

#[test]
fn test_double_deferred_free_is_rejected() {
    let fx = Fixture::new(1 << 20);
    let ptr = fx.manager.malloc("matmul", 64).unwrap();
    fx.manager.free("matmul", ptr, false).unwrap();

    let err = fx.manager.free("matmul", ptr, false).unwrap_err();
    assert!(matches!(err, DeviceMemoryError::DoubleFree(p) if p == ptr));
    assert!(err.is_internal_error());
    assert_eq!(fx.manager.snapshot().unwrap().free_list_blocks, 1);
}

#[test]
fn test_deferred_free_of_untracked_pointer() {
    let fx = Fixture::new(1 << 20);
    let err = fx
        .manager
        .free("matmul", DevicePtr::from_addr(0x1234_0000), false)
        .unwrap_err();
    assert!(matches!(err, DeviceMemoryError::CorruptedState(_)));
}

#[test]
fn test_blocks_are_zeroed_fresh_and_reused() {
    let fx = Fixture::new(8 << 20);
    for size in [8usize, 4096, 1 << 20] {
        let ptr = fx.manager.malloc("zero", size as i64).unwrap();
        assert!(fx.is_zeroed(ptr), "fresh block of {} bytes not zeroed", size);

        fx.fill(ptr, size, 0xFF);
        fx.manager.free("zero", ptr, false).unwrap();

        let reused = fx.manager.malloc("zero", size as i64).unwrap();
        assert_eq!(reused, ptr);
        assert!(fx.is_zeroed(reused), "reused block of {} bytes not zeroed", size);
    }
}

#[test]
fn test_scenario_second_request_evicts_unlocked_object() {
    // 600 bytes go to a resident object, leaving 1000 free
    let fx = Fixture::new(1600);
    let host = HostMirror::new(&fx.device);
    let object = fx.resident(600, &host);
    assert_eq!(fx.manager.available_memory().unwrap(), 900);

    let first = fx.manager.malloc("solve", 500).unwrap();
    assert_eq!(fx.manager.counters().evictions(), 0);
    assert_eq!(fx.manager.available_memory().unwrap(), 450);

    let second = fx.manager.malloc("solve", 500).unwrap();
    assert_ne!(first, second);
    assert_eq!(fx.manager.counters().evictions(), 1);
    assert!(!object.is_resident().unwrap());
    assert_eq!(fx.manager.resident_count().unwrap(), 0);
    assert_eq!(fx.manager.reserved_bytes().unwrap(), 1000);
    fx.assert_accounting();
}

#[test]
fn test_transient_failure_falls_through() {
    let fx = Fixture::new(1000);
    fx.device.fail_next_allocations(1).unwrap();

    let ptr = fx.manager.malloc("matmul", 100).unwrap();

    assert!(fx.is_zeroed(ptr));
    assert_eq!(fx.manager.counters().transient_failures(), 1);
    assert_eq!(fx.manager.counters().fresh_allocations(), 1);
    fx.assert_accounting();
}

#[test]
fn test_non_exact_reuse_releases_larger_block() {
    let fx = Fixture::new(1000);
    let large = fx.manager.malloc("matmul", 600).unwrap();
    fx.manager.free("matmul", large, false).unwrap();
    // 400 free, 360 usable: 500 needs the parked block back
    let ptr = fx.manager.malloc("matmul", 500).unwrap();

    assert!(!fx.device.is_live(large).unwrap());
    assert!(fx.device.is_live(ptr).unwrap());
    let counters = fx.manager.counters().snapshot();
    assert_eq!(counters.non_exact_reuses, 1);
    assert_eq!(counters.eager_drains, 0);
    assert_eq!(fx.manager.reserved_bytes().unwrap(), 500);
    fx.assert_accounting();
}

#[test]
fn test_eager_drain_when_no_larger_block() {
    let fx = Fixture::new(1000);
    let a = fx.manager.malloc("matmul", 300).unwrap();
    let b = fx.manager.malloc("matmul", 300).unwrap();
    fx.manager.free("matmul", a, false).unwrap();
    fx.manager.free("matmul", b, false).unwrap();

    fx.manager.malloc("matmul", 500).unwrap();

    let counters = fx.manager.counters().snapshot();
    assert_eq!(counters.non_exact_reuses, 0);
    assert_eq!(counters.eager_drains, 1);
    let snapshot = fx.manager.snapshot().unwrap();
    assert_eq!(snapshot.free_list_blocks, 0);
    assert_eq!(snapshot.reserved_bytes, 500);
    fx.assert_accounting();
}

#[test]
fn test_out_of_memory_carries_snapshot() {
    let fx = Fixture::new(1000);
    fx.device.set_external_reserved(900).unwrap();
    assert_eq!(fx.manager.available_memory().unwrap(), 90);

    let err = fx.manager.malloc("matmul", 100).unwrap_err();
    assert!(err.is_recoverable());
    assert!(matches!(
        err,
        DeviceMemoryError::OutOfDeviceMemory { requested: 100, .. }
    ));
    assert!(err.to_string().contains("Num of device objects"));
    assert_eq!(fx.manager.counters().snapshot().out_of_memory, 1);
}

#[test]
fn test_negative_and_zero_sizes() {
    let fx = Fixture::new(1000);
    assert!(fx.manager.malloc("matmul", -8).unwrap_err().is_user_error());

    let a = fx.manager.malloc("matmul", 0).unwrap();
    let b = fx.manager.malloc("matmul", 0).unwrap();
    assert_ne!(a, b);
    assert_eq!(fx.manager.reserved_bytes().unwrap(), 0);
    fx.manager.free("matmul", a, true).unwrap();
    fx.manager.free("matmul", b, false).unwrap();
    fx.assert_accounting();
}

#[test]
fn test_eager_free_returns_memory() {
    let fx = Fixture::new(1000);
    let ptr = fx.manager.malloc("matmul", 800).unwrap();
    assert_eq!(fx.manager.available_memory().unwrap(), 180);

    fx.manager.free("matmul", ptr, true).unwrap();
    assert_eq!(fx.manager.available_memory().unwrap(), 900);
    assert_eq!(fx.manager.snapshot().unwrap().free_list_blocks, 0);
    fx.assert_accounting();
}

#[test]
fn test_eager_free_of_parked_block_unparks_it() {
    let fx = Fixture::new(1000);
    let ptr = fx.manager.malloc("matmul", 100).unwrap();
    fx.manager.free("matmul", ptr, false).unwrap();

    fx.manager.free("matmul", ptr, true).unwrap();

    let snapshot = fx.manager.snapshot().unwrap();
    assert_eq!(snapshot.tracked_pointers, 0);
    assert_eq!(snapshot.free_list_blocks, 0);
    assert_eq!(snapshot.free_list_bytes, 0);
    assert!(!fx.device.is_live(ptr).unwrap());
    for _ in 0..3 {
        let again = fx.manager.malloc("matmul", 100).unwrap();
        assert!(fx.device.is_live(again).unwrap());
        assert!(fx.is_zeroed(again));
        fx.manager.free("matmul", again, false).unwrap();
    }
    fx.assert_accounting();
}

#[test]
fn test_clear_transient_keeps_residents() {
    let fx = Fixture::new(4096);
    let host = HostMirror::new(&fx.device);
    let object = fx.resident(200, &host);
    let live = fx.manager.malloc("matmul", 100).unwrap();
    let parked = fx.manager.malloc("matmul", 300).unwrap();
    fx.manager.free("matmul", parked, false).unwrap();

    let released = fx.manager.clear_transient().unwrap();

    assert_eq!(released, 300);
    assert!(object.is_resident().unwrap());
    assert!(fx.device.is_live(live).unwrap());
    assert!(!fx.device.is_live(parked).unwrap());
    assert_eq!(fx.manager.reserved_bytes().unwrap(), 300);
    fx.assert_accounting();
}

#[test]
fn test_clear_all_flushes_dirty_and_releases_everything() {
    let fx = Fixture::new(4096);
    let host = HostMirror::new(&fx.device);
    let dirty = fx.resident(256, &host);
    let clean = fx.resident(128, &host);
    let _live = fx.manager.malloc("matmul", 64).unwrap();
    let parked = fx.manager.malloc("matmul", 32).unwrap();
    fx.manager.free("matmul", parked, false).unwrap();

    let dirty_ptr = match dirty.footprint().unwrap() {
        Some(DeviceFootprint::Dense(block)) => block.ptr,
        other => panic!("unexpected footprint {:?}", other),
    };
    fx.fill(dirty_ptr, 256, 0x42);
    dirty.mark_dirty();

    fx.manager.clear_all().unwrap();

    assert_eq!(host.flushes(), 1);
    assert_eq!(host.copy_of(dirty_ptr), Some(vec![0x42; 256]));
    assert!(!dirty.is_resident().unwrap());
    assert!(!clean.is_resident().unwrap());
    assert_eq!(fx.manager.resident_count().unwrap(), 0);
    assert_eq!(fx.manager.reserved_bytes().unwrap(), 0);
    assert_eq!(fx.device.live_blocks().unwrap(), 0);
}

#[test]
fn test_clear_all_stops_before_releasing_on_writeback_failure() {
    let fx = Fixture::new(4096);
    let ptr = fx.manager.malloc("matmul", 128).unwrap();
    let object = fx
        .manager
        .register_resident(
            DeviceFootprint::dense(ptr, 128),
            |_: &DeviceFootprint| -> DeviceResult<()> {
                Err(DeviceError::CopyFailed("host buffer gone".into()))
            },
        )
        .unwrap();
    object.mark_dirty();
    let blocks_before = fx.device.live_blocks().unwrap();

    let err = fx.manager.clear_all().unwrap_err();

    assert!(matches!(err, DeviceMemoryError::WritebackFailed { .. }));
    assert!(object.is_resident().unwrap());
    assert_eq!(fx.device.live_blocks().unwrap(), blocks_before);
    fx.assert_accounting();
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(MemoryOp, String)>>,
}

impl MemoryStatsSink for RecordingSink {
    fn record(&self, op: MemoryOp, tag: &str, _elapsed: Duration) {
        self.events.lock().unwrap().push((op, tag.to_string()));
    }
}

#[test]
fn test_stats_sink_sees_tagged_operations() {
    let sink = Arc::new(RecordingSink::default());
    let device = Arc::new(SimulatedDevice::new(4096));
    let manager = DeviceMemoryManager::new(device, AllocatorConfig::default())
        .unwrap()
        .with_stats_sink(sink.clone());

    let ptr = manager.malloc("transpose", 64).unwrap();
    manager.free("transpose", ptr, false).unwrap();
    manager.malloc("transpose", 64).unwrap();

    let events = sink.events.lock().unwrap();
    let ops: Vec<MemoryOp> = events.iter().map(|(op, _)| *op).collect();
    assert_eq!(
        ops,
        vec![
            MemoryOp::Allocate,
            MemoryOp::ZeroFill,
            MemoryOp::Free,
            MemoryOp::Reuse,
            MemoryOp::ZeroFill,
        ]
    );
    assert!(events.iter().all(|(_, tag)| tag == "transpose"));
}

#[test]
fn test_drain_inside_malloc_uses_caller_tag() {
    let sink = Arc::new(RecordingSink::default());
    let device = Arc::new(SimulatedDevice::new(1000));
    let manager = DeviceMemoryManager::new(device, AllocatorConfig::default())
        .unwrap()
        .with_stats_sink(sink.clone());
    let a = manager.malloc("setup", 300).unwrap();
    let b = manager.malloc("setup", 300).unwrap();
    manager.free("setup", a, false).unwrap();
    manager.free("setup", b, false).unwrap();
    sink.events.lock().unwrap().clear();

    // Neither parked block fits, so both are drained first
    manager.malloc("solve", 500).unwrap();

    assert_eq!(manager.counters().snapshot().eager_drains, 1);
    let events = sink.events.lock().unwrap();
    assert!(events.contains(&(MemoryOp::Free, "solve".to_string())));
    assert!(events.iter().all(|(_, tag)| tag == "solve"));
}

#[test]
fn test_diagnostic_summary_reports_device_and_counters() {
    let fx = Fixture::new(1000);
    let host = HostMirror::new(&fx.device);
    let object = fx.resident(100, &host);
    let _pin = object.lock().unwrap();

    let summary = fx.manager.diagnostic_summary().unwrap();
    assert!(summary.contains("900 of 1000 bytes free"));
    assert!(summary.contains("[unlocked:0, locked:1]"));
    assert!(summary.contains("[unlocked:0, locked:100]"));
}
