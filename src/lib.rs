//! rocm-devcache - caching device-memory allocator for AMD GPUs
//!
//! Brokers every device allocation of a matrix-computation runtime: freed
//! blocks are cached for reuse, computed values living on the device are
//! tracked with pin and dirty state, and unpinned values are evicted back
//! to the host when the device runs short.
//!
//! The device itself is abstracted behind [`DeviceMemory`]. The `rocm`
//! feature enables the HIP implementation; [`SimulatedDevice`] is a
//! host-backed stand-in used by tests, the bench and the `devcache_sim`
//! binary.

#![allow(clippy::should_implement_trait)] // `from_str` helpers return Option, like the rest of the config parsing
#![allow(clippy::missing_safety_doc)] // FFI bindings documented at module level

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod metrics;

#[cfg(feature = "rocm")]
pub use backend::HipDeviceMemory;
pub use backend::{DeviceError, DeviceMemory, DevicePtr, SimulatedDevice};
pub use config::AllocatorConfig;
pub use error::{DeviceMemoryError, DeviceMemoryResult, ErrorCategory};
pub use memory::{
    DeviceFootprint, DeviceMemoryManager, EvictionPolicy, HostWriteback, MemorySnapshot,
    PinGuard, ResidentObject,
};
pub use metrics::PrometheusSink;
