//! Kernel error types, replacing ad-hoc string literals throughout the
//! memory and scheduling subsystems.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// A pool or the bump arena could not satisfy a request.
    AllocationExhausted { size: usize },
    /// The scheduler's task table has no free slot for a new TaskId.
    TaskTableFull,
    /// A TaskId lookup missed, or referred to an already-destroyed task.
    InvalidTaskId { id: u64 },
    /// `create_task`'s affinity mask excludes every core the scheduler
    /// brought up.
    NoEligibleCore,
    /// A subsystem was initialized twice.
    AlreadyExists { subsystem: &'static str },
    /// A subsystem was used before its `init()` ran.
    NotInitialized { subsystem: &'static str },
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationExhausted { size } => {
                write!(f, "allocation exhausted for size {size}")
            }
            Self::TaskTableFull => write!(f, "task table full"),
            Self::InvalidTaskId { id } => write!(f, "invalid task id {id}"),
            Self::NoEligibleCore => write!(f, "no core satisfies the requested affinity mask"),
            Self::AlreadyExists { subsystem } => {
                write!(f, "{subsystem} already initialized")
            }
            Self::NotInitialized { subsystem } => {
                write!(f, "{subsystem} not initialized")
            }
        }
    }
}

#[macro_export]
macro_rules! kernel_error {
    (AllocationExhausted { size: $size:expr }) => {
        $crate::error::KernelError::AllocationExhausted { size: $size }
    };
    (InvalidTaskId { id: $id:expr }) => {
        $crate::error::KernelError::InvalidTaskId { id: $id }
    };
    ($variant:ident) => {
        $crate::error::KernelError::$variant
    };
}
