//! Managed heap errors

use strata_alloc::AllocError;
use thiserror::Error;

use crate::finalization::FinalizerError;

/// Errors reported by the managed heap
#[derive(Debug, Error)]
pub enum GcError {
    /// The allocator could not obtain storage
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes
        size: usize,
    },

    /// Host misuse of the reference-count or tracking contract
    #[error("invariant violation: {0}")]
    InvariantViolation(#[from] InvariantViolation),

    /// Generation index outside `0..=2`
    #[error("invalid generation {0} (expected 0, 1 or 2)")]
    InvalidGeneration(usize),

    /// A finalizer was registered for an object that already ran one
    #[error("object already finalized")]
    AlreadyFinalized,

    /// Payload accessed as the wrong type
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Requested payload type
        expected: &'static str,
        /// Actual payload type
        found: &'static str,
    },

    /// A finalizer invoked on request reported failure
    #[error("finalizer failed: {0}")]
    Finalizer(#[from] FinalizerError),

    /// Heap configuration is unusable
    #[error("invalid heap config: {0}")]
    InvalidConfig(&'static str),
}

/// Contract violations detected at the API boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    /// Reference count would exceed `usize::MAX`
    #[error("reference count overflow")]
    RefcountOverflow,

    /// `decref` on an object whose count is already zero
    #[error("reference count underflow")]
    RefcountUnderflow,

    /// Handle does not name a live object
    #[error("object is not live")]
    DeadObject,

    /// `track` on an already tracked object
    #[error("object already tracked")]
    AlreadyTracked,

    /// `untrack` on an untracked object
    #[error("object not tracked")]
    NotTracked,

    /// Storage handed back to the allocator was rejected
    #[error("allocator rejected free: {0}")]
    InvalidFree(AllocError),
}

impl From<AllocError> for GcError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfMemory { size } => GcError::OutOfMemory { size },
            AllocError::InvalidConfig(reason) => GcError::InvalidConfig(reason),
            other => GcError::InvariantViolation(InvariantViolation::InvalidFree(other)),
        }
    }
}

impl GcError {
    /// Whether this is an allocation failure
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, GcError::OutOfMemory { .. })
    }
}

/// Result type for heap operations
pub type Result<T> = std::result::Result<T, GcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_error_mapping() {
        let err: GcError = AllocError::OutOfMemory { size: 64 }.into();
        assert!(err.is_out_of_memory());
        assert_eq!(err.to_string(), "out of memory allocating 64 bytes");

        let err: GcError = AllocError::InvalidFree { addr: 0x10 }.into();
        assert!(matches!(
            err,
            GcError::InvariantViolation(InvariantViolation::InvalidFree(_))
        ));
    }

    #[test]
    fn test_invariant_display() {
        let err = GcError::from(InvariantViolation::RefcountUnderflow);
        assert_eq!(err.to_string(), "invariant violation: reference count underflow");
        assert_eq!(
            GcError::InvalidGeneration(3).to_string(),
            "invalid generation 3 (expected 0, 1 or 2)"
        );
    }
}
