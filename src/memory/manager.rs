//! Caching device allocator
//!
//! [`DeviceMemoryManager`] brokers every device allocation for one device
//! context. Deferred frees park blocks in a size-bucketed free list; a
//! request tries, in order:
//!
//! 1. exact reuse of a parked block of the same size
//! 2. a fresh allocation, if it fits in `floor(device_free * utilization)`
//! 3. releasing the smallest larger parked block, then a fresh allocation
//! 4. releasing every parked block, then a fresh allocation
//! 5. evicting unpinned resident objects, then a fresh allocation
//!
//! and fails with [`DeviceMemoryError::OutOfDeviceMemory`] when all of them
//! come up short. Whatever path produced the block, it is zeroed before it
//! is returned.
//!
//! # Locking
//!
//! The pointer table and free list share one mutex; the resident registry
//! sits behind an `RwLock`; each resident object has its own state lock.
//! They are always taken in that order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::backend::{DeviceError, DeviceMemory, DevicePtr};
use crate::config::AllocatorConfig;
use crate::error::{DeviceMemoryError, DeviceMemoryResult};

use super::free_list::FreeList;
use super::pointer_table::PointerTable;
use super::resident::{
    AccessClock, Detached, DeviceFootprint, HostWriteback, ResidentId, ResidentObject,
    ResidentRegistry,
};
use super::snapshot::MemorySnapshot;
use super::stats::{AllocatorCounters, MemoryOp, MemoryStatsSink};

/// Tag for stats recorded by teardown that no caller asked for
const INTERNAL_TAG: &str = "devcache";

#[derive(Debug, Default)]
struct AllocatorState {
    pointers: PointerTable,
    free_list: FreeList,
}

pub struct DeviceMemoryManager<D: DeviceMemory> {
    device: D,
    config: AllocatorConfig,
    state: Mutex<AllocatorState>,
    residents: RwLock<ResidentRegistry>,
    clock: Arc<AccessClock>,
    next_resident_id: AtomicU64,
    counters: AllocatorCounters,
    sink: Option<Arc<dyn MemoryStatsSink>>,
}

impl<D: DeviceMemory> std::fmt::Debug for DeviceMemoryManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemoryManager")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("residents", &self.residents)
            .field("counters", &self.counters)
            .finish()
    }
}

impl<D: DeviceMemory> DeviceMemoryManager<D> {
    pub fn new(device: D, config: AllocatorConfig) -> DeviceMemoryResult<Self> {
        config.validate()?;
        let (free, total) = device.query_free_and_total()?;
        info!(
            utilization_factor = config.utilization_factor,
            eviction_policy = config.eviction_policy.as_str(),
            device_free = free,
            device_total = total,
            "device memory manager created"
        );
        Ok(DeviceMemoryManager {
            device,
            config,
            state: Mutex::new(AllocatorState::default()),
            residents: RwLock::new(ResidentRegistry::new()),
            clock: Arc::new(AccessClock::new()),
            next_resident_id: AtomicU64::new(0),
            counters: AllocatorCounters::new(),
            sink: None,
        })
    }

    /// Forward timed operations to `sink` in addition to the built-in counters
    pub fn with_stats_sink(mut self, sink: Arc<dyn MemoryStatsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn counters(&self) -> &AllocatorCounters {
        &self.counters
    }

    /// Allocate a zero-filled block of `size` bytes
    ///
    /// `tag` names the caller in logs and stats.
    pub fn malloc(&self, tag: &str, size: i64) -> DeviceMemoryResult<DevicePtr> {
        let size = usize::try_from(size).map_err(|_| {
            DeviceMemoryError::InvalidArgument(format!(
                "allocation size must be non-negative, got {}",
                size
            ))
        })?;

        let mut state = self.state.lock()?;

        let start = Instant::now();
        if let Some(ptr) = state.free_list.take_exact(size) {
            self.counters.record_reuse_hit();
            self.record(MemoryOp::Reuse, tag, start.elapsed());
            trace!(tag, %ptr, size, "reused free-list block");
            return self.zero_fill(&mut state, tag, ptr, size);
        }

        let start = Instant::now();
        let allocated = self.allocate_without_eviction(&mut state, tag, size)?;
        self.record(MemoryOp::Allocate, tag, start.elapsed());
        if let Some(ptr) = allocated {
            return self.zero_fill(&mut state, tag, ptr, size);
        }

        let start = Instant::now();
        let allocated = self.evict_and_allocate(&mut state, tag, size)?;
        self.record(MemoryOp::Evict, tag, start.elapsed());
        match allocated {
            Some(ptr) => self.zero_fill(&mut state, tag, ptr, size),
            None => {
                self.counters.record_out_of_memory();
                let snapshot = self.snapshot_locked(&state)?;
                warn!(tag, size, %snapshot, "device memory exhausted");
                Err(DeviceMemoryError::OutOfDeviceMemory {
                    requested: size,
                    snapshot,
                })
            }
        }
    }

    /// Return a block
    ///
    /// An eager free goes straight back to the device and is not validated.
    /// A deferred free parks the block for reuse; the pointer must have come
    /// from this manager and must not already be parked.
    pub fn free(&self, tag: &str, ptr: DevicePtr, eager: bool) -> DeviceMemoryResult<()> {
        if ptr.is_null() {
            return Ok(());
        }

        let start = Instant::now();
        let mut state = self.state.lock()?;
        if eager {
            self.device.release(ptr)?;
            if let Some(size) = state.pointers.remove(ptr) {
                if state.free_list.remove(ptr, size) {
                    debug!(tag, %ptr, size, "eager free of a parked block");
                }
            }
            self.counters.record_device_release();
            trace!(tag, %ptr, "released block to device");
        } else {
            let size = state.pointers.size_of(ptr).ok_or_else(|| {
                DeviceMemoryError::CorruptedState(format!(
                    "deferred free of pointer {} that was never allocated",
                    ptr
                ))
            })?;
            if !state.free_list.release(ptr, size) {
                return Err(DeviceMemoryError::DoubleFree(ptr));
            }
            trace!(tag, %ptr, size, "parked block in free list");
        }
        self.record(MemoryOp::Free, tag, start.elapsed());
        Ok(())
    }

    /// Flush every dirty resident object, then release everything
    ///
    /// Blocks still held by callers are released as well. If a write-back
    /// fails nothing has been released yet.
    pub fn clear_all(&self) -> DeviceMemoryResult<()> {
        let mut state = self.state.lock()?;
        let mut registry = self.residents.write()?;

        for object in registry.iter() {
            object.flush()?;
        }

        let mut first_error = None;
        let objects = registry.drain();
        let object_count = objects.len();
        for object in objects {
            if let Some(footprint) = object.take_footprint()? {
                if let Err(err) = self.release_footprint(&mut state, &footprint) {
                    first_error.get_or_insert(err);
                }
            }
        }
        drop(registry);

        if let Err(err) = self.drain_free_list(&mut state, INTERNAL_TAG) {
            first_error.get_or_insert(err);
        }

        for ptr in state.pointers.pointers() {
            if let Err(err) = self.release_tracked(&mut state, ptr) {
                first_error.get_or_insert(err);
            }
        }

        debug!(
            residents = object_count,
            remaining_bytes = state.pointers.total_bytes(),
            "cleared device memory"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Release every parked block, keeping resident objects on the device
    ///
    /// Returns the number of bytes given back.
    pub fn clear_transient(&self) -> DeviceMemoryResult<usize> {
        let mut state = self.state.lock()?;
        let released = self.drain_free_list(&mut state, INTERNAL_TAG)?;
        debug!(released, "released free-list blocks");
        Ok(released)
    }

    /// Track a computed value living in blocks obtained from [`malloc`]
    ///
    /// Ownership of the blocks moves to the resident object; they are
    /// released by eviction, [`remove_resident`] or [`clear_all`].
    ///
    /// [`malloc`]: Self::malloc
    /// [`remove_resident`]: Self::remove_resident
    /// [`clear_all`]: Self::clear_all
    pub fn register_resident<W>(
        &self,
        footprint: DeviceFootprint,
        writeback: W,
    ) -> DeviceMemoryResult<Arc<ResidentObject>>
    where
        W: HostWriteback + 'static,
    {
        let state = self.state.lock()?;
        let mut registry = self.residents.write()?;

        let blocks = footprint.blocks();
        for (i, block) in blocks.iter().enumerate() {
            match state.pointers.size_of(block.ptr) {
                None => {
                    return Err(DeviceMemoryError::CorruptedState(format!(
                        "resident block {} was not allocated by this manager",
                        block.ptr
                    )))
                }
                Some(size) if size != block.size => {
                    return Err(DeviceMemoryError::InvalidArgument(format!(
                        "resident block {} declared as {} bytes but holds {}",
                        block.ptr, block.size, size
                    )))
                }
                Some(_) => {}
            }
            if state.free_list.contains(block.ptr) {
                return Err(DeviceMemoryError::CorruptedState(format!(
                    "resident block {} has already been freed",
                    block.ptr
                )));
            }
            if blocks[..i].iter().any(|other| other.ptr == block.ptr) {
                return Err(DeviceMemoryError::CorruptedState(format!(
                    "block {} appears twice in one footprint",
                    block.ptr
                )));
            }
        }
        for other in registry.iter() {
            if let Some(owned) = other.footprint()? {
                if owned
                    .blocks()
                    .iter()
                    .any(|held| blocks.iter().any(|block| block.ptr == held.ptr))
                {
                    return Err(DeviceMemoryError::CorruptedState(format!(
                        "block already owned by resident object {}",
                        other.id()
                    )));
                }
            }
        }

        let id = self.next_resident_id.fetch_add(1, Ordering::SeqCst);
        let object = Arc::new(ResidentObject::new(
            id,
            footprint,
            self.clock.clone(),
            Box::new(writeback),
        ));
        registry.insert(object.clone());
        trace!(id, bytes = footprint.size_on_device(), "registered resident object");
        Ok(object)
    }

    /// Drop a resident object without writing it back
    ///
    /// Its blocks go back to the device when `eager`, to the free list
    /// otherwise. Pinned objects are rejected.
    pub fn remove_resident(&self, tag: &str, id: ResidentId, eager: bool) -> DeviceMemoryResult<()> {
        let start = Instant::now();
        let mut state = self.state.lock()?;
        let mut registry = self.residents.write()?;

        let object = registry.get(id).ok_or_else(|| {
            DeviceMemoryError::InvalidArgument(format!("unknown resident object {}", id))
        })?;

        let mut duplicate = None;
        match object.detach(false)? {
            Detached::Pinned => {
                return Err(DeviceMemoryError::InvalidArgument(format!(
                    "resident object {} is pinned ({} locks)",
                    id,
                    object.lock_count()
                )))
            }
            Detached::Gone => {}
            Detached::Taken {
                footprint,
                was_dirty,
            } => {
                if was_dirty {
                    debug!(tag, id, "discarding dirty resident object");
                }
                if eager {
                    self.release_footprint(&mut state, &footprint)?;
                } else {
                    for block in footprint.blocks() {
                        if !state.free_list.release(block.ptr, block.size) {
                            duplicate.get_or_insert(block.ptr);
                        }
                    }
                }
            }
        }
        registry.remove(id);
        self.record(MemoryOp::Free, tag, start.elapsed());
        match duplicate {
            Some(ptr) => Err(DeviceMemoryError::DoubleFree(ptr)),
            None => Ok(()),
        }
    }

    pub fn resident(&self, id: ResidentId) -> DeviceMemoryResult<Option<Arc<ResidentObject>>> {
        Ok(self.residents.read()?.get(id))
    }

    pub fn resident_count(&self) -> DeviceMemoryResult<usize> {
        Ok(self.residents.read()?.len())
    }

    pub fn snapshot(&self) -> DeviceMemoryResult<MemorySnapshot> {
        let state = self.state.lock()?;
        self.snapshot_locked(&state)
    }

    /// Bytes a fresh allocation may take right now
    pub fn available_memory(&self) -> DeviceMemoryResult<usize> {
        let (free, _total) = self.device.query_free_and_total()?;
        Ok(self.config.usable(free))
    }

    /// Bytes currently reserved from the device through this manager
    pub fn reserved_bytes(&self) -> DeviceMemoryResult<usize> {
        Ok(self.state.lock()?.pointers.total_bytes())
    }

    /// Human-readable report of device usage and allocator state
    pub fn diagnostic_summary(&self) -> DeviceMemoryResult<String> {
        let snapshot = self.snapshot()?;
        let (free, total) = self.device.query_free_and_total()?;
        let counters = self.counters.snapshot();
        Ok(format!(
            "Device memory: {} of {} bytes free ({} usable at utilization {}). {}. \
             Allocator: {} fresh, {} reused, {} evictions ({} bytes), {} transient failures, {} out-of-memory",
            free,
            total,
            self.config.usable(free),
            self.config.utilization_factor,
            snapshot,
            counters.fresh_allocations,
            counters.reuse_hits,
            counters.evictions,
            counters.evicted_bytes,
            counters.transient_failures,
            counters.out_of_memory,
        ))
    }

    fn record(&self, op: MemoryOp, tag: &str, elapsed: Duration) {
        self.counters.record_elapsed(op, elapsed);
        if let Some(sink) = &self.sink {
            sink.record(op, tag, elapsed);
        }
    }

    fn snapshot_locked(&self, state: &AllocatorState) -> DeviceMemoryResult<MemorySnapshot> {
        let registry = self.residents.read()?;
        let mut snapshot = MemorySnapshot {
            reserved_bytes: state.pointers.total_bytes(),
            tracked_pointers: state.pointers.len(),
            free_list_blocks: state.free_list.len(),
            free_list_bytes: state.free_list.total_bytes(),
            ..MemorySnapshot::default()
        };
        for object in registry.iter() {
            let Some(footprint) = object.footprint()? else {
                continue;
            };
            if object.is_locked() {
                snapshot.locked_objects += 1;
                snapshot.locked_bytes += footprint.size_on_device();
            } else {
                snapshot.unlocked_objects += 1;
                snapshot.unlocked_bytes += footprint.size_on_device();
            }
        }
        Ok(snapshot)
    }

    fn zero_fill(
        &self,
        state: &mut AllocatorState,
        tag: &str,
        ptr: DevicePtr,
        size: usize,
    ) -> DeviceMemoryResult<DevicePtr> {
        let start = Instant::now();
        if let Err(err) = self.device.zero(ptr, size) {
            match err {
                // The device no longer knows the block; stop tracking it
                DeviceError::UnknownPointer(_) => {
                    state.pointers.remove(ptr);
                    warn!(tag, %ptr, size, "dropping block unknown to the device");
                }
                _ => {
                    state.free_list.release(ptr, size);
                }
            }
            return Err(err.into());
        }
        self.counters.record_zero_fill();
        self.record(MemoryOp::ZeroFill, tag, start.elapsed());
        Ok(ptr)
    }

    /// Strategies 2-4: fresh, non-exact reuse, eager drain
    fn allocate_without_eviction(
        &self,
        state: &mut AllocatorState,
        tag: &str,
        size: usize,
    ) -> DeviceMemoryResult<Option<DevicePtr>> {
        if let Some(ptr) = self.try_fresh(state, size)? {
            trace!(tag, %ptr, size, "fresh allocation");
            return Ok(Some(ptr));
        }

        if let Some((larger, victim)) = state.free_list.take_smallest_above(size) {
            if let Err(err) = self.release_tracked(state, victim) {
                state.free_list.release(victim, larger);
                return Err(err);
            }
            self.counters.record_non_exact_reuse();
            if let Some(ptr) = self.try_fresh(state, size)? {
                trace!(tag, %ptr, size, released = larger, "non-exact reuse");
                return Ok(Some(ptr));
            }
        }

        if !state.free_list.is_empty() {
            let released = self.drain_free_list(state, tag)?;
            self.counters.record_eager_drain();
            if let Some(ptr) = self.try_fresh(state, size)? {
                trace!(tag, %ptr, size, released, "allocation after draining free list");
                return Ok(Some(ptr));
            }
        }

        Ok(None)
    }

    /// Strategy 5: evict unpinned residents until the request fits
    fn evict_and_allocate(
        &self,
        state: &mut AllocatorState,
        tag: &str,
        size: usize,
    ) -> DeviceMemoryResult<Option<DevicePtr>> {
        let mut registry = self.residents.write()?;
        let order = registry.eviction_order(self.config.eviction_policy, size)?;

        for object in order {
            if self.available_memory()? >= size {
                break;
            }
            self.evict_one(state, &mut registry, tag, &object)?;
        }
        drop(registry);

        let allocated = self.try_fresh(state, size)?;
        if let Some(ptr) = allocated {
            trace!(tag, %ptr, size, "allocation after eviction");
        }
        Ok(allocated)
    }

    /// Evict `object` unless it was pinned since the order was computed
    fn evict_one(
        &self,
        state: &mut AllocatorState,
        registry: &mut ResidentRegistry,
        tag: &str,
        object: &ResidentObject,
    ) -> DeviceMemoryResult<Option<usize>> {
        let footprint = match object.detach(true)? {
            Detached::Taken { footprint, .. } => footprint,
            Detached::Pinned => {
                trace!(tag, id = object.id(), "skipping pinned eviction candidate");
                return Ok(None);
            }
            Detached::Gone => return Ok(None),
        };

        registry.remove(object.id());
        let bytes = footprint.size_on_device();
        self.release_footprint(state, &footprint)?;
        self.counters.record_eviction(bytes);
        debug!(
            tag,
            id = object.id(),
            bytes,
            sparse = footprint.is_sparse(),
            "evicted resident object"
        );
        Ok(Some(bytes))
    }

    /// Allocate from the device if the request fits the usable headroom
    ///
    /// A device failure despite headroom is logged and reported as `None` so
    /// the caller moves on to the next strategy.
    fn try_fresh(&self, state: &mut AllocatorState, size: usize) -> DeviceMemoryResult<Option<DevicePtr>> {
        if size > self.available_memory()? {
            return Ok(None);
        }

        let ptr = match self.device.allocate(size) {
            Ok(ptr) if !ptr.is_null() => ptr,
            Ok(_) => {
                self.counters.record_transient_failure();
                warn!(size, "device returned a null block; trying next strategy");
                return Ok(None);
            }
            Err(source) => {
                self.counters.record_transient_failure();
                let err = DeviceMemoryError::TransientAllocationFailure { size, source };
                warn!(error = %err, "trying next strategy");
                return Ok(None);
            }
        };

        if state.pointers.contains(ptr) {
            return Err(DeviceMemoryError::CorruptedState(format!(
                "device returned pointer {} that is still tracked",
                ptr
            )));
        }
        state.pointers.insert(ptr, size);
        self.counters.record_fresh_allocation();
        Ok(Some(ptr))
    }

    /// Release a tracked block to the device and stop tracking it
    fn release_tracked(&self, state: &mut AllocatorState, ptr: DevicePtr) -> DeviceMemoryResult<()> {
        self.device.release(ptr)?;
        state.pointers.remove(ptr);
        self.counters.record_device_release();
        Ok(())
    }

    /// Release every block of `footprint`, reporting the first failure
    fn release_footprint(
        &self,
        state: &mut AllocatorState,
        footprint: &DeviceFootprint,
    ) -> DeviceMemoryResult<()> {
        let mut first_error = None;
        for block in footprint.blocks() {
            if let Err(err) = self.release_tracked(state, block.ptr) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Release every parked block; blocks that fail to release stay parked
    fn drain_free_list(&self, state: &mut AllocatorState, tag: &str) -> DeviceMemoryResult<usize> {
        let start = Instant::now();
        let mut released = 0;
        let mut first_error = None;
        for (size, ptr) in state.free_list.drain_all() {
            match self.release_tracked(state, ptr) {
                Ok(()) => released += size,
                Err(err) => {
                    state.free_list.release(ptr, size);
                    first_error.get_or_insert(err);
                }
            }
        }
        self.record(MemoryOp::Free, tag, start.elapsed());
        match first_error {
            Some(err) => Err(err),
            None => Ok(released),
        }
    }
}

impl<D: DeviceMemory> Drop for DeviceMemoryManager<D> {
    fn drop(&mut self) {
        let dirty = match self.residents.get_mut() {
            Ok(registry) => registry.iter().filter(|object| object.is_dirty()).count(),
            Err(_) => 0,
        };
        if dirty > 0 {
            warn!(dirty, "dropping manager with dirty resident objects; contents are lost");
        }

        let Ok(state) = self.state.get_mut() else {
            return;
        };
        for ptr in state.pointers.pointers() {
            if let Err(err) = self.device.release(ptr) {
                warn!(%ptr, error = %err, "failed to release block on teardown");
            }
        }
        state.pointers.clear();
    }
}
