//! Device backends
//!
//! - [`device`]: the `DeviceMemory` primitives and `DevicePtr` handle
//! - [`sim`]: host-backed simulated device (tests, benches, `devcache_sim`)
//! - `hip_backend`: ROCm/HIP device memory (feature `rocm`)

pub mod device;
#[cfg(feature = "rocm")]
pub mod hip_backend;
pub mod sim;

pub use device::{DeviceError, DeviceMemory, DevicePtr, DeviceResult};
#[cfg(feature = "rocm")]
pub use hip_backend::HipDeviceMemory;
pub use sim::SimulatedDevice;
