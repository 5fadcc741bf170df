//! Allocated-pointer table
//!
//! Records the size of every block currently reserved from the device,
//! whether it is in use by a caller, owned by a resident object or parked in
//! the free list. The running total always equals the sum of the entries.

use std::collections::HashMap;

use crate::backend::DevicePtr;

#[derive(Debug, Default)]
pub struct PointerTable {
    sizes: HashMap<DevicePtr, usize>,
    total_bytes: usize,
}

impl PointerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly reserved block, returning the previous size if the
    /// device handed out an address that was still tracked.
    pub fn insert(&mut self, ptr: DevicePtr, size: usize) -> Option<usize> {
        let previous = self.sizes.insert(ptr, size);
        if let Some(old) = previous {
            self.total_bytes -= old;
        }
        self.total_bytes += size;
        previous
    }

    pub fn remove(&mut self, ptr: DevicePtr) -> Option<usize> {
        let size = self.sizes.remove(&ptr)?;
        self.total_bytes -= size;
        Some(size)
    }

    pub fn size_of(&self, ptr: DevicePtr) -> Option<usize> {
        self.sizes.get(&ptr).copied()
    }

    pub fn contains(&self, ptr: DevicePtr) -> bool {
        self.sizes.contains_key(&ptr)
    }

    /// Bytes reserved from the device
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn pointers(&self) -> Vec<DevicePtr> {
        self.sizes.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.sizes.clear();
        self.total_bytes = 0;
    }
}
