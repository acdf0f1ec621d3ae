//! Error Module - GMA Error Types
//!
//! Defines all error types returned by the allocator.
//!
//! # Error Categories
//!
//! ## Capacity Errors (recoverable)
//! - `OutOfMemory` - No block could host the request and no new block was created
//! - `BudgetExceeded` - Growing the vector would exceed the heap-type budget
//! - `TooManyBlocks` - The vector already holds `max_block_count` blocks
//!
//! ## Usage Errors
//! - `InvalidArgument` - Invalid function argument
//! - `Unsupported` - Operation not available for this block algorithm
//! - `InvalidState` - Call made in the wrong state (defragmentation protocol)
//!
//! ## Collaborator Errors
//! - `Device` - Heap or placed-resource creation failed in the device layer
//! - `Configuration` - Invalid configuration
//!
//! ## Bugs
//! - `Internal` - Bookkeeping inconsistency detected at a recoverable point
//!
//! Corruption of block metadata (double free, unknown handle, mixing linear
//! ring-buffer and double-stack use) is not reported through this type. Those
//! paths panic, since continuing would hand out overlapping memory.

use crate::budget::HeapType;
use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for all GMA operations
///
/// # Examples
///
/// ```rust
/// use gma::GmaError;
///
/// fn describe(err: &GmaError) -> &'static str {
///     match err {
///         GmaError::OutOfMemory { .. } | GmaError::BudgetExceeded { .. } => "fall back to a dedicated allocation",
///         _ if err.is_bug() => "report",
///         _ => "fix the caller",
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum GmaError {
    /// Out of memory - no block fits the request
    ///
    /// **When returned:** Every existing block rejected the request and a new
    /// block could not be created (or the request exceeds the preferred block size)
    ///
    /// **Recovery strategy:** Fall back to a committed (dedicated) allocation
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: u64, available: u64 },

    /// Budget exceeded
    ///
    /// **When returned:** Creating a new block would push usage over the budget
    /// reported for the heap type, and the request asked to stay within budget
    ///
    /// **Recovery strategy:** Free memory, defragment, or retry later
    #[error("Budget exceeded for {heap_type:?} heap: requested {requested} bytes, usage {usage} of {budget} bytes")]
    BudgetExceeded {
        heap_type: HeapType,
        requested: u64,
        usage: u64,
        budget: u64,
    },

    /// Block count limit reached
    ///
    /// **When returned:** A new block is needed but the vector holds `max` blocks
    ///
    /// **Recovery strategy:** Same as `OutOfMemory`
    #[error("Block vector already holds the maximum of {max} blocks")]
    TooManyBlocks { max: usize },

    /// Invalid argument
    ///
    /// **When returned:** Function argument fails validation
    ///
    /// **Example scenarios:**
    /// - Zero-sized allocation
    /// - Alignment not a power of two
    /// - Unknown allocation id
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not supported
    ///
    /// **When returned:** Defragmenting a linear block vector, upper-address
    /// allocation on a non-linear vector
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Invalid state
    ///
    /// **When returned:** Defragmentation pass calls out of order
    ///
    /// **Recovery strategy:** Cannot recover - indicates caller bug
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Device layer failure
    ///
    /// **When returned:** Heap or placed-resource creation failed
    ///
    /// **Recovery strategy:** Treated like `OutOfMemory` by the block vector
    #[error("Device error: {0}")]
    Device(String),

    /// Configuration error
    ///
    /// **When returned:** Invalid block vector or defragmentation configuration
    ///
    /// **Recovery strategy:** Use default configuration or fail fast
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error - indicates a bug in GMA
    ///
    /// **Action required:** Report to developers with full stack trace
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GmaError {
    /// Check if this error is recoverable by trying another placement path
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GmaError::OutOfMemory { .. }
                | GmaError::BudgetExceeded { .. }
                | GmaError::TooManyBlocks { .. }
                | GmaError::Device(_)
        )
    }

    /// Check if this error indicates a bug in the code
    pub fn is_bug(&self) -> bool {
        matches!(self, GmaError::InvalidState { .. } | GmaError::Internal(_))
    }
}

impl From<ConfigError> for GmaError {
    fn from(err: ConfigError) -> Self {
        GmaError::Configuration(err.to_string())
    }
}

/// Result type alias for GMA operations
pub type Result<T> = std::result::Result<T, GmaError>;

/// Macro for early return with error
#[macro_export]
macro_rules! bail {
    ($err:expr) => {
        return Err($err.into())
    };
}

/// Ensure condition is true, otherwise return error
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err.into());
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_errors_are_recoverable() {
        let oom = GmaError::OutOfMemory {
            requested: 1024,
            available: 0,
        };
        assert!(oom.is_recoverable());
        assert!(!oom.is_bug());

        let budget = GmaError::BudgetExceeded {
            heap_type: HeapType::Default,
            requested: 10,
            usage: 90,
            budget: 95,
        };
        assert!(budget.is_recoverable());
        assert!(GmaError::TooManyBlocks { max: 4 }.is_recoverable());
    }

    #[test]
    fn test_state_errors_are_bugs() {
        let err = GmaError::InvalidState {
            expected: "PassActive".to_string(),
            actual: "Idle".to_string(),
        };
        assert!(err.is_bug());
        assert!(!err.is_recoverable());
        assert!(!GmaError::InvalidArgument("x".into()).is_bug());
    }

    #[test]
    fn test_ensure_macro() {
        fn check(size: u64) -> Result<u64> {
            ensure!(size > 0, GmaError::InvalidArgument("size must be > 0".into()));
            Ok(size)
        }
        assert!(check(0).is_err());
        assert_eq!(check(4).ok(), Some(4));
    }

    #[test]
    fn test_display_messages() {
        let err = GmaError::OutOfMemory {
            requested: 64,
            available: 32,
        };
        assert_eq!(
            err.to_string(),
            "Out of memory: requested 64 bytes, available 32 bytes"
        );
    }
}
