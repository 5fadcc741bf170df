//! Resident objects: computed values materialized on the device
//!
//! A resident object owns one dense block or up to three sparse blocks
//! (row pointers, column indices, values). The compute layer pins it while
//! kernels read it, marks it dirty when the device copy gets ahead of the
//! host copy, and touches it on access. The allocator only reads those
//! signals when it needs to evict.
//!
//! # Pinning
//!
//! Pins are scoped: [`ResidentObject::lock`] returns a [`PinGuard`] that
//! releases the pin when dropped, on every exit path. Taking a pin briefly
//! holds the object's state lock, and eviction checks the pin count under
//! that same lock, so an object can never be pinned and evicted at once. A
//! pin taken on an object that lost the race is still valid but the object
//! is no longer resident; callers check [`ResidentObject::is_resident`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{DevicePtr, DeviceResult};
use crate::error::{DeviceMemoryError, DeviceMemoryResult};

use super::eviction::{EvictionCandidate, EvictionPolicy};

/// Identifier assigned at registration
pub type ResidentId = u64;

/// One device block owned by a resident object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBlock {
    pub ptr: DevicePtr,
    pub size: usize,
}

impl DeviceBlock {
    pub fn new(ptr: DevicePtr, size: usize) -> Self {
        DeviceBlock { ptr, size }
    }
}

/// Device layout of a resident object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFootprint {
    Dense(DeviceBlock),
    /// CSR arrays; each one is optional and tracked independently
    Sparse {
        row_ptr: Option<DeviceBlock>,
        col_idx: Option<DeviceBlock>,
        values: Option<DeviceBlock>,
    },
}

impl DeviceFootprint {
    pub fn dense(ptr: DevicePtr, size: usize) -> Self {
        DeviceFootprint::Dense(DeviceBlock::new(ptr, size))
    }

    /// Every block in the footprint (one for dense, up to three for sparse)
    pub fn blocks(&self) -> Vec<DeviceBlock> {
        match self {
            DeviceFootprint::Dense(block) => vec![*block],
            DeviceFootprint::Sparse {
                row_ptr,
                col_idx,
                values,
            } => [row_ptr, col_idx, values]
                .into_iter()
                .flatten()
                .copied()
                .collect(),
        }
    }

    pub fn size_on_device(&self) -> usize {
        self.blocks().iter().map(|block| block.size).sum()
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, DeviceFootprint::Sparse { .. })
    }
}

/// Copies a resident object's device contents back to its host copy
///
/// Called synchronously during eviction and teardown while allocator locks
/// are held; implementations must not call back into the allocator.
pub trait HostWriteback: Send + Sync {
    fn write_back(&self, footprint: &DeviceFootprint) -> DeviceResult<()>;
}

impl<F> HostWriteback for F
where
    F: Fn(&DeviceFootprint) -> DeviceResult<()> + Send + Sync,
{
    fn write_back(&self, footprint: &DeviceFootprint) -> DeviceResult<()> {
        self(footprint)
    }
}

/// Logical clock for last-access timestamps, one per manager
#[derive(Debug, Default)]
pub struct AccessClock(AtomicU64);

impl AccessClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ResidentObject {
    id: ResidentId,
    /// `None` once evicted or released
    footprint: Mutex<Option<DeviceFootprint>>,
    lock_count: AtomicUsize,
    dirty: AtomicBool,
    last_access: AtomicU64,
    clock: Arc<AccessClock>,
    writeback: Box<dyn HostWriteback>,
}

impl fmt::Debug for ResidentObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResidentObject")
            .field("id", &self.id)
            .field("lock_count", &self.lock_count())
            .field("dirty", &self.is_dirty())
            .field("last_access", &self.last_access())
            .finish()
    }
}

impl ResidentObject {
    pub(crate) fn new(
        id: ResidentId,
        footprint: DeviceFootprint,
        clock: Arc<AccessClock>,
        writeback: Box<dyn HostWriteback>,
    ) -> Self {
        let last_access = clock.tick();
        ResidentObject {
            id,
            footprint: Mutex::new(Some(footprint)),
            lock_count: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            last_access: AtomicU64::new(last_access),
            clock,
            writeback,
        }
    }

    pub fn id(&self) -> ResidentId {
        self.id
    }

    /// Pin the object until the returned guard is dropped
    pub fn lock(&self) -> DeviceMemoryResult<PinGuard<'_>> {
        let _footprint = self.footprint.lock()?;
        self.lock_count.fetch_add(1, Ordering::SeqCst);
        self.touch();
        Ok(PinGuard { object: self })
    }

    pub fn lock_count(&self) -> usize {
        self.lock_count.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count() > 0
    }

    /// Record that the device copy is newer than the host copy
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Record an access for recency ordering
    pub fn touch(&self) {
        self.last_access.store(self.clock.tick(), Ordering::SeqCst);
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::SeqCst)
    }

    pub fn footprint(&self) -> DeviceMemoryResult<Option<DeviceFootprint>> {
        Ok(*self.footprint.lock()?)
    }

    pub fn is_resident(&self) -> DeviceMemoryResult<bool> {
        Ok(self.footprint.lock()?.is_some())
    }

    /// Bytes held on the device, zero once evicted
    pub fn size_on_device(&self) -> DeviceMemoryResult<usize> {
        let footprint = self.footprint.lock()?;
        Ok((*footprint)
            .map(|footprint| footprint.size_on_device())
            .unwrap_or(0))
    }

    fn candidate(&self) -> DeviceMemoryResult<Option<EvictionCandidate>> {
        let footprint = self.footprint.lock()?;
        Ok((*footprint).map(|footprint| EvictionCandidate {
            id: self.id,
            locked: self.is_locked(),
            size: footprint.size_on_device(),
            last_access: self.last_access(),
        }))
    }

    fn flush_locked(&self, footprint: &DeviceFootprint) -> DeviceMemoryResult<()> {
        if self.is_dirty() {
            self.writeback
                .write_back(footprint)
                .map_err(|source| DeviceMemoryError::WritebackFailed {
                    id: self.id,
                    source,
                })?;
            self.dirty.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Give up the footprint unless the object is pinned
    ///
    /// The pin count is re-read under the state lock, so a pin taken after
    /// an eviction order was computed is still honored. With `flush` set a
    /// dirty object is written back first and stays resident if that fails.
    pub(crate) fn detach(&self, flush: bool) -> DeviceMemoryResult<Detached> {
        let mut footprint = self.footprint.lock()?;
        if self.is_locked() {
            return Ok(Detached::Pinned);
        }
        let Some(current) = *footprint else {
            return Ok(Detached::Gone);
        };
        if flush {
            self.flush_locked(&current)?;
        }
        let was_dirty = self.dirty.swap(false, Ordering::SeqCst);
        *footprint = None;
        Ok(Detached::Taken {
            footprint: current,
            was_dirty,
        })
    }

    /// Flush if dirty, keeping the footprint
    pub(crate) fn flush(&self) -> DeviceMemoryResult<()> {
        let footprint = self.footprint.lock()?;
        if let Some(current) = footprint.as_ref() {
            self.flush_locked(current)?;
        }
        Ok(())
    }

    /// Give up the footprint regardless of pins (teardown only)
    pub(crate) fn take_footprint(&self) -> DeviceMemoryResult<Option<DeviceFootprint>> {
        let mut footprint = self.footprint.lock()?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(footprint.take())
    }
}

/// Outcome of [`ResidentObject::detach`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Detached {
    Pinned,
    Gone,
    Taken {
        footprint: DeviceFootprint,
        /// Dirty state before detaching; always false after a flush
        was_dirty: bool,
    },
}

impl Detached {
    #[cfg(test)]
    pub(crate) fn footprint(self) -> Option<DeviceFootprint> {
        match self {
            Detached::Taken { footprint, .. } => Some(footprint),
            Detached::Pinned | Detached::Gone => None,
        }
    }
}

/// Scoped pin on a resident object
#[derive(Debug)]
pub struct PinGuard<'a> {
    object: &'a ResidentObject,
}

impl PinGuard<'_> {
    pub fn object(&self) -> &ResidentObject {
        self.object
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.object.lock_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry of live resident objects, in registration order
#[derive(Debug, Default)]
pub struct ResidentRegistry {
    objects: BTreeMap<ResidentId, Arc<ResidentObject>>,
}

impl ResidentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: Arc<ResidentObject>) -> Option<Arc<ResidentObject>> {
        self.objects.insert(object.id(), object)
    }

    pub fn remove(&mut self, id: ResidentId) -> Option<Arc<ResidentObject>> {
        self.objects.remove(&id)
    }

    pub fn get(&self, id: ResidentId) -> Option<Arc<ResidentObject>> {
        self.objects.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResidentObject>> {
        self.objects.values()
    }

    pub fn drain(&mut self) -> Vec<Arc<ResidentObject>> {
        std::mem::take(&mut self.objects).into_values().collect()
    }

    /// Objects that still hold device memory, most-evictable first
    pub fn eviction_order(
        &self,
        policy: EvictionPolicy,
        needed: usize,
    ) -> DeviceMemoryResult<Vec<Arc<ResidentObject>>> {
        let mut candidates = Vec::with_capacity(self.objects.len());
        for object in self.objects.values() {
            if let Some(candidate) = object.candidate()? {
                candidates.push(candidate);
            }
        }
        policy.order(&mut candidates, needed);
        Ok(candidates
            .iter()
            .filter_map(|candidate| self.objects.get(&candidate.id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceError;
    use std::sync::atomic::AtomicUsize;

    fn noop_writeback() -> Box<dyn HostWriteback> {
        Box::new(|_: &DeviceFootprint| -> DeviceResult<()> { Ok(()) })
    }

    fn object(id: ResidentId, size: usize, clock: &Arc<AccessClock>) -> ResidentObject {
        ResidentObject::new(
            id,
            DeviceFootprint::dense(DevicePtr::from_addr(0x1000 * (id as usize + 1)), size),
            clock.clone(),
            noop_writeback(),
        )
    }

    #[test]
    fn test_sparse_footprint_blocks() {
        let footprint = DeviceFootprint::Sparse {
            row_ptr: Some(DeviceBlock::new(DevicePtr::from_addr(0x100), 40)),
            col_idx: None,
            values: Some(DeviceBlock::new(DevicePtr::from_addr(0x200), 80)),
        };
        assert_eq!(footprint.blocks().len(), 2);
        assert_eq!(footprint.size_on_device(), 120);
        assert!(footprint.is_sparse());
    }

    #[test]
    fn test_pin_guard_releases_on_drop() {
        let clock = Arc::new(AccessClock::new());
        let obj = object(1, 64, &clock);
        {
            let _a = obj.lock().unwrap();
            let _b = obj.lock().unwrap();
            assert_eq!(obj.lock_count(), 2);
        }
        assert_eq!(obj.lock_count(), 0);
        assert!(!obj.is_locked());
    }

    #[test]
    fn test_pin_guard_releases_on_panic() {
        let clock = Arc::new(AccessClock::new());
        let obj = object(1, 64, &clock);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _pin = obj.lock().unwrap();
            panic!("kernel failed");
        }));
        assert!(result.is_err());
        assert_eq!(obj.lock_count(), 0);
    }

    #[test]
    fn test_touch_advances_timestamp() {
        let clock = Arc::new(AccessClock::new());
        let a = object(1, 64, &clock);
        let b = object(2, 64, &clock);
        assert!(a.last_access() < b.last_access());
        a.touch();
        assert!(a.last_access() > b.last_access());
    }

    #[test]
    fn test_pinned_object_is_not_detached() {
        let clock = Arc::new(AccessClock::new());
        let obj = object(1, 64, &clock);
        let pin = obj.lock().unwrap();
        assert_eq!(obj.detach(true).unwrap(), Detached::Pinned);
        assert!(obj.is_resident().unwrap());
        drop(pin);
        assert!(obj.detach(true).unwrap().footprint().is_some());
        assert_eq!(obj.detach(true).unwrap(), Detached::Gone);
        assert!(!obj.is_resident().unwrap());
        assert_eq!(obj.size_on_device().unwrap(), 0);
    }

    #[test]
    fn test_dirty_object_flushed_once_on_detach() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let counter = flushes.clone();
        let obj = ResidentObject::new(
            7,
            DeviceFootprint::dense(DevicePtr::from_addr(0x100), 8),
            Arc::new(AccessClock::new()),
            Box::new(move |_: &DeviceFootprint| -> DeviceResult<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        obj.mark_dirty();
        obj.flush().unwrap();
        assert!(!obj.is_dirty());
        obj.detach(true).unwrap();
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_writeback_keeps_object_resident() {
        let obj = ResidentObject::new(
            3,
            DeviceFootprint::dense(DevicePtr::from_addr(0x100), 8),
            Arc::new(AccessClock::new()),
            Box::new(|_: &DeviceFootprint| -> DeviceResult<()> {
                Err(DeviceError::CopyFailed("bus error".into()))
            }),
        );
        obj.mark_dirty();
        let err = obj.detach(true).unwrap_err();
        assert!(matches!(err, DeviceMemoryError::WritebackFailed { id: 3, .. }));
        assert!(obj.is_resident().unwrap());
        assert!(obj.is_dirty());
    }

    #[test]
    fn test_registry_eviction_order_skips_detached() {
        let clock = Arc::new(AccessClock::new());
        let mut registry = ResidentRegistry::new();
        for id in 0..3 {
            registry.insert(Arc::new(object(id, 100 * (id as usize + 1), &clock)));
        }
        registry.get(1).unwrap().take_footprint().unwrap();

        let order = registry
            .eviction_order(EvictionPolicy::Recency, 0)
            .unwrap();
        let ids: Vec<ResidentId> = order.iter().map(|o| o.id()).collect();
        assert_eq!(ids, vec![0, 2]);
    }
}
