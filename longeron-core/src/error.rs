/// Longeron Core Error Types
///
/// Errors raised by the protocol-agnostic kernel (chunk allocation, pipes).

use thiserror::Error;

/// Main error type for kernel operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A chunk could not be allocated (size overflow or allocator failure)
    #[error("Out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },

    /// The peer side of a pipe or channel is gone
    #[error("Pipe closed")]
    Closed,
}

/// Result type alias for kernel operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create an out-of-memory error for a request of `size` bytes
    #[must_use]
    pub const fn out_of_memory(size: usize) -> Self {
        Self::OutOfMemory { size }
    }

    /// Check if retrying the operation later may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
