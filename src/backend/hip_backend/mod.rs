//! ROCm/HIP implementation of the device primitives
//!
//! Compiled only with the `rocm` feature, which also makes `build.rs` link
//! against `libamdhip64`.

mod device_context;
mod ffi;
mod memory;

pub use device_context::{ensure_device, get_thread_device};
pub use memory::HipDeviceMemory;
