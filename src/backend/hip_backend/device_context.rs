//! Per-thread HIP device selection
//!
//! HIP device context is PER-THREAD: `hipSetDevice()` only affects the
//! calling thread. The allocator is shared across threads, so every call
//! into the runtime first makes sure the calling thread targets the device
//! the allocator was created for.

use std::cell::Cell;
use std::ffi::CStr;

use super::ffi;
use crate::backend::device::{DeviceError, DeviceResult};

thread_local! {
    static THREAD_DEVICE_ID: Cell<i32> = const { Cell::new(-1) };
}

pub(crate) fn error_string(code: i32) -> String {
    // SAFETY: hipGetErrorString returns a pointer to a static C string or null.
    unsafe {
        let msg = ffi::hipGetErrorString(code);
        if msg.is_null() {
            format!("HIP error {}", code)
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

/// Current HIP device of the calling thread (cached after the first query)
pub fn get_thread_device() -> DeviceResult<i32> {
    THREAD_DEVICE_ID.with(|cell| {
        let cached = cell.get();
        if cached >= 0 {
            return Ok(cached);
        }

        let mut device: i32 = -1;
        let result = unsafe { ffi::hipGetDevice(&mut device) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::QueryFailed(format!(
                "hipGetDevice failed: {}",
                error_string(result)
            )));
        }

        cell.set(device);
        Ok(device)
    })
}

/// Switch the calling thread to `expected_device` if it is not already there
pub fn ensure_device(expected_device: i32) -> DeviceResult<()> {
    let current = get_thread_device()?;
    if current != expected_device {
        tracing::debug!(
            current,
            expected_device,
            "device mismatch, calling hipSetDevice"
        );

        let result = unsafe { ffi::hipSetDevice(expected_device) };
        if result != ffi::HIP_SUCCESS {
            return Err(DeviceError::QueryFailed(format!(
                "hipSetDevice({}) failed: {}",
                expected_device,
                error_string(result)
            )));
        }

        THREAD_DEVICE_ID.with(|cell| cell.set(expected_device));
    }
    Ok(())
}
