//! `hipMalloc`-backed device memory

use super::device_context::{ensure_device, error_string};
use super::ffi;
use crate::backend::device::{DeviceError, DeviceMemory, DevicePtr, DeviceResult};

/// Device primitives for one HIP device
#[derive(Debug, Clone, Copy)]
pub struct HipDeviceMemory {
    device_id: i32,
}

impl HipDeviceMemory {
    pub fn new(device_id: i32) -> DeviceResult<Self> {
        ensure_device(device_id)?;
        let memory = HipDeviceMemory { device_id };
        let (free, total) = memory.query_free_and_total()?;
        tracing::info!(
            device_id,
            free_mb = free / 1024 / 1024,
            total_mb = total / 1024 / 1024,
            "HIP device memory opened"
        );
        Ok(memory)
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Blocking device-to-host copy, used by write-back hooks
    pub fn copy_to_host(&self, ptr: DevicePtr, out: &mut [u8]) -> DeviceResult<()> {
        ensure_device(self.device_id)?;
        let result = unsafe {
            ffi::hipMemcpy(
                out.as_mut_ptr() as *mut std::ffi::c_void,
                ptr.as_raw(),
                out.len(),
                ffi::HIP_MEMCPY_DEVICE_TO_HOST,
            )
        };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::CopyFailed(format!(
                "hipMemcpy D2H of {} bytes from {} failed: {}",
                out.len(),
                ptr,
                error_string(result)
            )));
        }
        Ok(())
    }

    /// Blocking host-to-device copy
    pub fn copy_from_host(&self, ptr: DevicePtr, data: &[u8]) -> DeviceResult<()> {
        ensure_device(self.device_id)?;
        let result = unsafe {
            ffi::hipMemcpy(
                ptr.as_raw(),
                data.as_ptr() as *const std::ffi::c_void,
                data.len(),
                ffi::HIP_MEMCPY_HOST_TO_DEVICE,
            )
        };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::CopyFailed(format!(
                "hipMemcpy H2D of {} bytes to {} failed: {}",
                data.len(),
                ptr,
                error_string(result)
            )));
        }
        Ok(())
    }
}

impl DeviceMemory for HipDeviceMemory {
    fn allocate(&self, size: usize) -> DeviceResult<DevicePtr> {
        ensure_device(self.device_id)?;
        let mut raw: *mut std::ffi::c_void = std::ptr::null_mut();
        // hipMalloc(0) hands back null; zero-byte blocks still need an address
        let result = unsafe { ffi::hipMalloc(&mut raw, size.max(1)) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::AllocationFailed {
                size,
                reason: error_string(result),
            });
        }
        if raw.is_null() {
            return Err(DeviceError::AllocationFailed {
                size,
                reason: "hipMalloc returned null pointer".to_string(),
            });
        }
        Ok(DevicePtr::from_raw(raw))
    }

    fn release(&self, ptr: DevicePtr) -> DeviceResult<()> {
        ensure_device(self.device_id)?;
        let result = unsafe { ffi::hipFree(ptr.as_raw()) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::ReleaseFailed {
                ptr,
                reason: error_string(result),
            });
        }
        Ok(())
    }

    fn zero(&self, ptr: DevicePtr, size: usize) -> DeviceResult<()> {
        if size == 0 {
            return Ok(());
        }
        ensure_device(self.device_id)?;
        let result = unsafe { ffi::hipMemset(ptr.as_raw(), 0, size) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::ZeroFailed {
                ptr,
                size,
                reason: error_string(result),
            });
        }
        Ok(())
    }

    fn query_free_and_total(&self) -> DeviceResult<(usize, usize)> {
        ensure_device(self.device_id)?;
        let mut free: usize = 0;
        let mut total: usize = 0;
        let result = unsafe { ffi::hipMemGetInfo(&mut free, &mut total) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::QueryFailed(format!(
                "hipMemGetInfo failed: {}",
                error_string(result)
            )));
        }
        Ok((free, total))
    }
}
