//! Error handling for the device-memory cache
//!
//! One error type covers every failure the allocator can surface. Errors are
//! categorized so callers can decide between fixing their input, retrying
//! after memory pressure eases, and reporting a bug:
//! - User errors (bad sizes, bad configuration)
//! - Recoverable errors (device memory exhausted, transient device failures)
//! - Internal errors (corrupted accounting, double free, poisoned locks)
//! - Backend errors (device primitive failures, failed write-back)

use std::fmt;

use crate::backend::{DeviceError, DevicePtr};
use crate::memory::{MemorySnapshot, ResidentId};

/// Unified error type for the allocator
#[derive(Debug, thiserror::Error)]
pub enum DeviceMemoryError {
    /// Negative size or invalid configuration value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Every reclamation strategy was exhausted
    #[error("Not enough device memory for a request of {requested} bytes. {snapshot}")]
    OutOfDeviceMemory {
        requested: usize,
        snapshot: MemorySnapshot,
    },

    /// Accounting disagrees with what a caller handed back
    #[error("Internal state corrupted: {0}")]
    CorruptedState(String),

    /// Deferred free of a pointer that is already waiting for reuse
    #[error("Internal state corrupted: double free of {0}")]
    DoubleFree(DevicePtr),

    /// The device refused an allocation despite reported headroom
    #[error("Transient allocation failure for {size} bytes: {source}")]
    TransientAllocationFailure { size: usize, source: DeviceError },

    /// A device primitive failed
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Flushing a dirty resident object to the host failed
    #[error("Write-back of resident object {id} failed: {source}")]
    WritebackFailed { id: ResidentId, source: DeviceError },

    /// Lock poisoned (indicates a bug in a thread holding allocator state)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl DeviceMemoryError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            DeviceMemoryError::InvalidArgument(_) => ErrorCategory::User,

            DeviceMemoryError::OutOfDeviceMemory { .. }
            | DeviceMemoryError::TransientAllocationFailure { .. } => ErrorCategory::Recoverable,

            DeviceMemoryError::CorruptedState(_)
            | DeviceMemoryError::DoubleFree(_)
            | DeviceMemoryError::LockPoisoned(_) => ErrorCategory::Internal,

            DeviceMemoryError::Device(_) | DeviceMemoryError::WritebackFailed { .. } => {
                ErrorCategory::Backend
            }
        }
    }

    /// Recoverable errors may succeed once memory pressure drops
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Recoverable)
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Internal errors are programmer errors: fail fast, never retry
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }

    /// Accounting snapshot attached to an out-of-memory failure
    pub fn snapshot(&self) -> Option<&MemorySnapshot> {
        match self {
            DeviceMemoryError::OutOfDeviceMemory { snapshot, .. } => Some(snapshot),
            _ => None,
        }
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input or configuration
    User,
    /// Temporary condition, may be retried
    Recoverable,
    /// Indicates a bug
    Internal,
    /// Device or write-back failure
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Backend => write!(f, "Backend"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DeviceMemoryError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DeviceMemoryError::LockPoisoned(err.to_string())
    }
}

pub type DeviceMemoryResult<T> = std::result::Result<T, DeviceMemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            DeviceMemoryError::InvalidArgument("size -1".into()).category(),
            ErrorCategory::User
        );
        assert_eq!(
            DeviceMemoryError::OutOfDeviceMemory {
                requested: 10,
                snapshot: MemorySnapshot::default(),
            }
            .category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            DeviceMemoryError::DoubleFree(DevicePtr::from_addr(0x10)).category(),
            ErrorCategory::Internal
        );
        assert_eq!(
            DeviceMemoryError::Device(DeviceError::QueryFailed("x".into())).category(),
            ErrorCategory::Backend
        );
    }

    #[test]
    fn test_structural_errors_are_not_recoverable() {
        let double_free = DeviceMemoryError::DoubleFree(DevicePtr::from_addr(0x10));
        assert!(double_free.is_internal_error());
        assert!(!double_free.is_recoverable());

        let corrupted = DeviceMemoryError::CorruptedState("untracked pointer".into());
        assert!(corrupted.is_internal_error());
    }

    #[test]
    fn test_out_of_memory_message_embeds_snapshot() {
        let snapshot = MemorySnapshot {
            locked_objects: 2,
            locked_bytes: 800,
            reserved_bytes: 800,
            ..MemorySnapshot::default()
        };
        let err = DeviceMemoryError::OutOfDeviceMemory {
            requested: 500,
            snapshot,
        };

        let msg = err.to_string();
        assert!(msg.contains("500 bytes"));
        assert!(msg.contains("locked:2"));
        assert_eq!(err.snapshot(), Some(&snapshot));
    }

    #[test]
    fn test_poison_conversion() {
        let lock = std::sync::Mutex::new(0);
        let _ = std::panic::catch_unwind(|| {
            let _guard = lock.lock().unwrap();
            panic!("poison");
        });
        let err: DeviceMemoryError = lock.lock().unwrap_err().into();
        assert!(matches!(err, DeviceMemoryError::LockPoisoned(_)));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Backend.to_string(), "Backend");
        assert_eq!(ErrorCategory::Recoverable.to_string(), "Recoverable");
    }
}
