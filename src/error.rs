//! Error types for allocator operations

use core::fmt;

/// Result type for allocator operations
pub type AllocResult<T> = Result<T, AllocError>;

/// Allocation and allocator-lifecycle errors
///
/// Every fallible operation in this crate reports failure through this type;
/// there is no global error state and no panicking path in release builds.
/// The variants mirror the ways a bump or frame allocator can refuse work:
/// acting on an unbuilt allocator, bad arguments, exhausted capacity,
/// address arithmetic wrapping, or a frame-discipline violation.
///
/// `AllocError` is `Copy` on purpose: an allocator must not allocate to
/// describe why it could not allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Operation on an allocator that has not been initialized
    Uninitialized,

    /// `initialize` called on an already-initialized allocator
    AlreadyInitialized,

    /// Invalid argument (zero size, non-power-of-two alignment, null or
    /// misaligned buffer, size outside the allocator's size-type range)
    InvalidArgument {
        /// What was wrong with the call
        reason: &'static str,
    },

    /// The backing buffer, reservation, or segment pool is exhausted,
    /// or the operating system refused to commit more pages
    OutOfMemory {
        /// Bytes the caller asked for
        requested: usize,
    },

    /// Alignment rounding or size addition wrapped past the address space
    Overflow,

    /// Allocation attempted on a frame allocator with no live frame
    NoLiveFrame,

    /// `release` attempted while frames are still live; the allocator
    /// keeps its memory (leaking it) rather than corrupting live state
    LiveFrames,

    /// The operating system refused a virtual-memory operation that is not
    /// an allocation (decommit or release); allocator state is unchanged
    SystemFailure {
        /// The virtual-memory operation that failed
        operation: &'static str,
    },
}

impl AllocError {
    /// Creates an invalid argument error
    #[inline]
    pub const fn invalid_argument(reason: &'static str) -> Self {
        Self::InvalidArgument { reason }
    }

    /// Creates an out of memory error
    #[inline]
    pub const fn out_of_memory(requested: usize) -> Self {
        Self::OutOfMemory { requested }
    }

    /// True for [`AllocError::OutOfMemory`]
    #[inline]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }

    /// True for errors caused by the call site (bad arguments or calling
    /// order) rather than by resource exhaustion
    #[inline]
    pub const fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::Uninitialized
                | Self::AlreadyInitialized
                | Self::InvalidArgument { .. }
                | Self::NoLiveFrame
                | Self::LiveFrames
        )
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => {
                write!(f, "allocator is not initialized")
            }
            Self::AlreadyInitialized => {
                write!(f, "allocator is already initialized")
            }
            Self::InvalidArgument { reason } => {
                write!(f, "invalid argument: {reason}")
            }
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: could not allocate {requested} bytes")
            }
            Self::Overflow => {
                write!(f, "allocation arithmetic overflowed the address space")
            }
            Self::NoLiveFrame => {
                write!(f, "allocation requires a live frame; push one first")
            }
            Self::LiveFrames => {
                write!(f, "cannot release allocator while frames are live")
            }
            Self::SystemFailure { operation } => {
                write!(f, "virtual memory {operation} failed")
            }
        }
    }
}

impl std::error::Error for AllocError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_request_size() {
        let err = AllocError::out_of_memory(4096);
        assert!(err.to_string().contains("4096"));
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn usage_errors_are_classified() {
        assert!(AllocError::Uninitialized.is_usage_error());
        assert!(AllocError::invalid_argument("zero size").is_usage_error());
        assert!(AllocError::LiveFrames.is_usage_error());
        assert!(!AllocError::Overflow.is_usage_error());
        assert!(!AllocError::out_of_memory(1).is_usage_error());
    }
}
