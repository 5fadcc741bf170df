//! Shared fixtures for allocator integration tests
//!
//! Every test gets its own [`SimulatedDevice`] and manager, so tests are
//! independent unless they touch process-wide state (environment, global
//! subscriber); those use `#[serial]`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rocm_devcache::backend::DeviceResult;
use rocm_devcache::{
    AllocatorConfig, DeviceFootprint, DeviceMemoryManager, DevicePtr, ResidentObject,
    SimulatedDevice,
};
pub use serial_test::serial;

pub type Manager = DeviceMemoryManager<Arc<SimulatedDevice>>;

pub struct Fixture {
    pub device: Arc<SimulatedDevice>,
    pub manager: Manager,
}

impl Fixture {
    pub fn new(capacity: usize) -> Self {
        Self::with_config(capacity, AllocatorConfig::default())
    }

    pub fn with_config(capacity: usize, config: AllocatorConfig) -> Self {
        let device = Arc::new(SimulatedDevice::new(capacity));
        let manager =
            DeviceMemoryManager::new(device.clone(), config).expect("manager construction");
        Fixture { device, manager }
    }

    /// Allocate `size` bytes and hand them to a new resident object
    pub fn resident(&self, size: usize, host: &HostMirror) -> Arc<ResidentObject> {
        let ptr = self.manager.malloc("fixture", size as i64).expect("resident malloc");
        self.manager
            .register_resident(DeviceFootprint::dense(ptr, size), host.writeback())
            .expect("resident registration")
    }

    /// Fill a whole block with `byte`
    pub fn fill(&self, ptr: DevicePtr, size: usize, byte: u8) {
        self.device
            .write(ptr, 0, &vec![byte; size])
            .expect("device write");
    }

    pub fn is_zeroed(&self, ptr: DevicePtr) -> bool {
        self.device
            .read(ptr)
            .expect("device read")
            .iter()
            .all(|b| *b == 0)
    }

    /// Manager accounting agrees with what the device actually holds
    pub fn assert_accounting(&self) {
        let snapshot = self.manager.snapshot().expect("snapshot");
        assert_eq!(
            snapshot.reserved_bytes,
            self.device.reserved_bytes().unwrap(),
            "reserved bytes diverged from the device: {}",
            snapshot
        );
        assert_eq!(
            snapshot.tracked_pointers,
            self.device.live_blocks().unwrap(),
            "tracked pointers diverged from the device: {}",
            snapshot
        );
    }
}

/// Host side of resident objects: records every write-back
#[derive(Clone, Default)]
pub struct HostMirror {
    device: Option<Arc<SimulatedDevice>>,
    copies: Arc<Mutex<HashMap<DevicePtr, Vec<u8>>>>,
    flushes: Arc<AtomicUsize>,
}

impl HostMirror {
    /// Mirror that copies block contents off `device`
    pub fn new(device: &Arc<SimulatedDevice>) -> Self {
        HostMirror {
            device: Some(device.clone()),
            ..Self::default()
        }
    }

    pub fn writeback(&self) -> impl Fn(&DeviceFootprint) -> DeviceResult<()> + Send + Sync + 'static {
        let mirror = self.clone();
        move |footprint: &DeviceFootprint| {
            mirror.flushes.fetch_add(1, Ordering::SeqCst);
            if let Some(device) = &mirror.device {
                let mut copies = mirror.copies.lock()?;
                for block in footprint.blocks() {
                    copies.insert(block.ptr, device.read(block.ptr)?);
                }
            }
            Ok(())
        }
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn copy_of(&self, ptr: DevicePtr) -> Option<Vec<u8>> {
        self.copies.lock().unwrap().get(&ptr).cloned()
    }
}
