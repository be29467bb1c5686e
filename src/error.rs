//! Kernel error type.

use core::fmt;

/// C-style error numbers reported by [`KernelError::errno`].
pub mod errno {
    pub const ESRCH: i32 = 3;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ENODATA: i32 = 61;
    pub const ETIMEDOUT: i32 = 110;
    pub const EALREADY: i32 = 114;
    pub const ENOTINITIALISED: i32 = 200;
}

/// Recoverable kernel errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// An argument was out of range or referred to the wrong object.
    InvalidArgument,
    /// The subsystem or object has not been set up yet.
    NotInitialised,
    /// The subsystem or object was already set up.
    AlreadyInitialised,
    /// A fixed-size pool (threads, stacks, timers) is exhausted.
    NoMemory,
    /// A non-blocking operation could not complete immediately.
    WouldBlock,
    /// A bounded wait expired before it was satisfied.
    Timeout,
    /// A thread handle is stale or was never issued.
    NoSuchThread,
    /// A message queue is full.
    QueueFull,
    /// A message queue is empty.
    QueueEmpty,
}

impl KernelError {
    /// Negative error code of the C-style surface.
    pub const fn errno(self) -> i32 {
        -match self {
            Self::InvalidArgument => errno::EINVAL,
            Self::NotInitialised => errno::ENOTINITIALISED,
            Self::AlreadyInitialised => errno::EALREADY,
            Self::NoMemory => errno::ENOMEM,
            Self::WouldBlock => errno::EAGAIN,
            Self::Timeout => errno::ETIMEDOUT,
            Self::NoSuchThread => errno::ESRCH,
            Self::QueueFull => errno::ENOSPC,
            Self::QueueEmpty => errno::ENODATA,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotInitialised => write!(f, "not initialised"),
            Self::AlreadyInitialised => write!(f, "already initialised"),
            Self::NoMemory => write!(f, "out of memory"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::Timeout => write!(f, "timed out"),
            Self::NoSuchThread => write!(f, "no such thread"),
            Self::QueueFull => write!(f, "queue full"),
            Self::QueueEmpty => write!(f, "queue empty"),
        }
    }
}

/// Result alias used throughout the kernel.
pub type KResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_is_negative() {
        assert_eq!(KernelError::InvalidArgument.errno(), -22);
        assert_eq!(KernelError::NotInitialised.errno(), -errno::ENOTINITIALISED);
        assert_eq!(KernelError::Timeout.errno(), -110);
    }

    #[test]
    fn test_display() {
        assert_eq!(KernelError::QueueFull.to_string(), "queue full");
    }
}
