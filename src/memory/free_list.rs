//! Free list of deferred-freed device blocks
//!
//! Blocks are bucketed by exact byte size. Within a bucket the oldest
//! released block is reused first. The registry is not synchronized on its
//! own; the manager keeps it behind the same lock as the pointer table so
//! `drain_all` is atomic with respect to concurrent releases.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::Bound;

use crate::backend::DevicePtr;

#[derive(Debug, Default)]
pub struct FreeList {
    buckets: BTreeMap<usize, VecDeque<DevicePtr>>,
    members: HashSet<DevicePtr>,
    total_bytes: usize,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `ptr` for reuse under `size`
    ///
    /// Returns `false` without modifying anything if `ptr` is already queued.
    pub fn release(&mut self, ptr: DevicePtr, size: usize) -> bool {
        if !self.members.insert(ptr) {
            return false;
        }
        self.buckets.entry(size).or_default().push_back(ptr);
        self.total_bytes += size;
        true
    }

    /// Pop the oldest block of exactly `size` bytes
    pub fn take_exact(&mut self, size: usize) -> Option<DevicePtr> {
        let bucket = self.buckets.get_mut(&size)?;
        let ptr = bucket.pop_front()?;
        if bucket.is_empty() {
            self.buckets.remove(&size);
        }
        self.members.remove(&ptr);
        self.total_bytes -= size;
        Some(ptr)
    }

    /// Pop the oldest block from the smallest bucket strictly larger than `size`
    pub fn take_smallest_above(&mut self, size: usize) -> Option<(usize, DevicePtr)> {
        let key = self
            .buckets
            .range((Bound::Excluded(size), Bound::Unbounded))
            .next()
            .map(|(key, _)| *key)?;
        self.take_exact(key).map(|ptr| (key, ptr))
    }

    /// Drop `ptr` from the `size` bucket wherever it sits in the queue
    ///
    /// Returns `false` if it was not queued under that size.
    pub fn remove(&mut self, ptr: DevicePtr, size: usize) -> bool {
        let Some(bucket) = self.buckets.get_mut(&size) else {
            return false;
        };
        let Some(index) = bucket.iter().position(|queued| *queued == ptr) else {
            return false;
        };
        bucket.remove(index);
        if bucket.is_empty() {
            self.buckets.remove(&size);
        }
        self.members.remove(&ptr);
        self.total_bytes -= size;
        true
    }

    /// Empty every bucket, smallest size first
    pub fn drain_all(&mut self) -> Vec<(usize, DevicePtr)> {
        let buckets = std::mem::take(&mut self.buckets);
        self.members.clear();
        self.total_bytes = 0;
        buckets
            .into_iter()
            .flat_map(|(size, ptrs)| ptrs.into_iter().map(move |ptr| (size, ptr)))
            .collect()
    }

    pub fn contains(&self, ptr: DevicePtr) -> bool {
        self.members.contains(&ptr)
    }

    /// Number of queued blocks
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Bytes held by queued blocks
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Number of distinct sizes queued
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
