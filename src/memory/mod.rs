//! Device-memory caching and resident-object eviction
//!
//! Repeated `hipMalloc`/`hipFree` pairs are slow and fragment the device
//! heap, so freed blocks are parked by exact size and handed back out on the
//! next request of that size. Computed values that live on the device are
//! tracked as resident objects; when fresh memory runs out, unpinned ones
//! are written back to the host and evicted.
//!
//! [`DeviceMemoryManager`] is the entry point; everything else here is its
//! bookkeeping.

pub mod eviction;
pub mod free_list;
pub mod manager;
pub mod pointer_table;
pub mod resident;
pub mod snapshot;
pub mod stats;

pub use eviction::{EvictionCandidate, EvictionPolicy};
pub use free_list::FreeList;
pub use manager::DeviceMemoryManager;
pub use pointer_table::PointerTable;
pub use resident::{
    AccessClock, DeviceBlock, DeviceFootprint, HostWriteback, PinGuard, ResidentId,
    ResidentObject, ResidentRegistry,
};
pub use snapshot::MemorySnapshot;
pub use stats::{AllocatorCounters, CounterSnapshot, MemoryOp, MemoryStatsSink, NoopSink};
