//! Device pointer handle and the allocation primitives the cache is built on
//!
//! Everything the allocator needs from a device fits in four calls:
//! allocate, release, zero and a free/total query. Backends implement
//! [`DeviceMemory`]; the allocator never touches raw driver APIs itself.

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Opaque handle to a block of device memory
///
/// Equality and hashing are by address only. `DevicePtr::NULL` is the
/// reserved sentinel that `free` treats as a no-op.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(usize);

impl DevicePtr {
    /// Reserved null sentinel
    pub const NULL: DevicePtr = DevicePtr(0);

    pub const fn from_addr(addr: usize) -> Self {
        DevicePtr(addr)
    }

    pub fn from_raw(ptr: *mut c_void) -> Self {
        DevicePtr(ptr as usize)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr(0x{:x})", self.0)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Errors reported by a device backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device allocation of {size} bytes failed: {reason}")]
    AllocationFailed { size: usize, reason: String },
    #[error("device release of {ptr} failed: {reason}")]
    ReleaseFailed { ptr: DevicePtr, reason: String },
    #[error("device memset of {size} bytes at {ptr} failed: {reason}")]
    ZeroFailed {
        ptr: DevicePtr,
        size: usize,
        reason: String,
    },
    #[error("device memory query failed: {0}")]
    QueryFailed(String),
    #[error("device copy failed: {0}")]
    CopyFailed(String),
    #[error("device does not own pointer {0}")]
    UnknownPointer(DevicePtr),
    #[error("device state lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for DeviceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DeviceError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Allocation primitives of one device context
///
/// Implementations must be safe to call from many threads at once. The
/// allocator serializes its own bookkeeping but not calls into the device,
/// and other processes may be competing for the same memory.
pub trait DeviceMemory: Send + Sync {
    /// Reserve `size` bytes. Contents are unspecified.
    fn allocate(&self, size: usize) -> DeviceResult<DevicePtr>;

    /// Return a block to the device
    fn release(&self, ptr: DevicePtr) -> DeviceResult<()>;

    /// Fill the first `size` bytes of a block with zeros
    fn zero(&self, ptr: DevicePtr, size: usize) -> DeviceResult<()>;

    /// Free and total bytes as reported by the device right now
    fn query_free_and_total(&self) -> DeviceResult<(usize, usize)>;
}

impl<D: DeviceMemory + ?Sized> DeviceMemory for Arc<D> {
    fn allocate(&self, size: usize) -> DeviceResult<DevicePtr> {
        (**self).allocate(size)
    }

    fn release(&self, ptr: DevicePtr) -> DeviceResult<()> {
        (**self).release(ptr)
    }

    fn zero(&self, ptr: DevicePtr, size: usize) -> DeviceResult<()> {
        (**self).zero(ptr, size)
    }

    fn query_free_and_total(&self) -> DeviceResult<(usize, usize)> {
        (**self).query_free_and_total()
    }
}
