//! Point-in-time accounting snapshot
//!
//! Attached to every out-of-memory error and printed by the diagnostic
//! summary.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    /// Resident objects that could be evicted
    pub unlocked_objects: usize,
    pub unlocked_bytes: usize,
    /// Resident objects pinned by the compute layer
    pub locked_objects: usize,
    pub locked_bytes: usize,
    /// Bytes currently reserved from the device
    pub reserved_bytes: usize,
    pub tracked_pointers: usize,
    pub free_list_blocks: usize,
    pub free_list_bytes: usize,
}

impl MemorySnapshot {
    pub fn resident_objects(&self) -> usize {
        self.unlocked_objects + self.locked_objects
    }

    pub fn resident_bytes(&self) -> usize {
        self.unlocked_bytes + self.locked_bytes
    }
}

impl fmt::Display for MemorySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Num of device objects: [unlocked:{}, locked:{}]. \
             Size of device objects in bytes: [unlocked:{}, locked:{}]. \
             Total memory reserved in bytes: {} ({} pointers, {} free-list blocks holding {} bytes)",
            self.unlocked_objects,
            self.locked_objects,
            self.unlocked_bytes,
            self.locked_bytes,
            self.reserved_bytes,
            self.tracked_pointers,
            self.free_list_blocks,
            self.free_list_bytes,
        )
    }
}
