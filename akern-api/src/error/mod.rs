//! Error handling module for the AKern kernel simulator
//!
//! Every mutating operation reports one of these kinds instead of panicking.
//! The syscall layer turns them into `{success = false, errorCode, errorMessage}`.

use alloc::string::{String, ToString};
use core::fmt;

/// Common error type used throughout AKern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No free page, descriptor, slot or other bounded resource
    ResourceExhausted(String),
    /// Invalid pid, path, handle or id
    NotFound(String),
    /// Capability, mode-bit or sandbox check failed
    PermissionDenied(String),
    /// Malformed or out-of-range argument
    InvalidArgument(String),
    /// A non-blocking operation would otherwise block
    WouldBlock,
    /// A timed operation expired
    Timeout,
    /// The object already exists
    AlreadyExists(String),
    /// The waiter was cancelled by termination or a signal
    Interrupted,
    /// The object is held or in use
    Busy(String),
    /// Write to a pipe whose read end is closed
    BrokenPipe,
    /// A known syscall number with no handler
    NotImplemented(String),
    /// An internal invariant was found broken; the operation was aborted
    InvariantViolation(String),
}

/// Fieldless mirror of [`Error`] for matching and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// See [`Error::ResourceExhausted`]
    ResourceExhausted,
    /// See [`Error::NotFound`]
    NotFound,
    /// See [`Error::PermissionDenied`]
    PermissionDenied,
    /// See [`Error::InvalidArgument`]
    InvalidArgument,
    /// See [`Error::WouldBlock`]
    WouldBlock,
    /// See [`Error::Timeout`]
    Timeout,
    /// See [`Error::AlreadyExists`]
    AlreadyExists,
    /// See [`Error::Interrupted`]
    Interrupted,
    /// See [`Error::Busy`]
    Busy,
    /// See [`Error::BrokenPipe`]
    BrokenPipe,
    /// See [`Error::NotImplemented`]
    NotImplemented,
    /// See [`Error::InvariantViolation`]
    InvariantViolation,
}

/// POSIX errno values reported by the syscall layer
pub mod errno {
    /// Operation not permitted
    pub const EPERM: i32 = 1;
    /// No such file or directory
    pub const ENOENT: i32 = 2;
    /// Interrupted system call
    pub const EINTR: i32 = 4;
    /// I/O error
    pub const EIO: i32 = 5;
    /// Try again
    pub const EAGAIN: i32 = 11;
    /// Out of memory
    pub const ENOMEM: i32 = 12;
    /// Permission denied
    pub const EACCES: i32 = 13;
    /// Device or resource busy
    pub const EBUSY: i32 = 16;
    /// File exists
    pub const EEXIST: i32 = 17;
    /// Invalid argument
    pub const EINVAL: i32 = 22;
    /// Broken pipe
    pub const EPIPE: i32 = 32;
    /// Function not implemented
    pub const ENOSYS: i32 = 38;
    /// Connection timed out
    pub const ETIMEDOUT: i32 = 110;
}

impl Error {
    /// Returns the fieldless kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::WouldBlock => ErrorKind::WouldBlock,
            Error::Timeout => ErrorKind::Timeout,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Interrupted => ErrorKind::Interrupted,
            Error::Busy(_) => ErrorKind::Busy,
            Error::BrokenPipe => ErrorKind::BrokenPipe,
            Error::NotImplemented(_) => ErrorKind::NotImplemented,
            Error::InvariantViolation(_) => ErrorKind::InvariantViolation,
        }
    }

    /// Returns the errno reported for this error
    pub fn errno(&self) -> i32 {
        self.kind().errno()
    }
}

impl ErrorKind {
    /// Returns the errno reported for this kind
    pub fn errno(self) -> i32 {
        match self {
            ErrorKind::ResourceExhausted => errno::ENOMEM,
            ErrorKind::NotFound => errno::ENOENT,
            ErrorKind::PermissionDenied => errno::EACCES,
            ErrorKind::InvalidArgument => errno::EINVAL,
            ErrorKind::WouldBlock => errno::EAGAIN,
            ErrorKind::Timeout => errno::ETIMEDOUT,
            ErrorKind::AlreadyExists => errno::EEXIST,
            ErrorKind::Interrupted => errno::EINTR,
            ErrorKind::Busy => errno::EBUSY,
            ErrorKind::BrokenPipe => errno::EPIPE,
            ErrorKind::NotImplemented => errno::ENOSYS,
            ErrorKind::InvariantViolation => errno::EIO,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::WouldBlock => write!(f, "Operation would block"),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            Error::Interrupted => write!(f, "Interrupted"),
            Error::Busy(msg) => write!(f, "Resource busy: {}", msg),
            Error::BrokenPipe => write!(f, "Broken pipe"),
            Error::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            Error::InvariantViolation(msg) => write!(f, "Invariant violation: {}", msg),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;

/// Creates a new not found error
pub fn not_found(msg: &str) -> Error {
    Error::NotFound(msg.to_string())
}

/// Creates a new invalid argument error
pub fn invalid_argument(msg: &str) -> Error {
    Error::InvalidArgument(msg.to_string())
}

/// Creates a new permission denied error
pub fn permission_denied(msg: &str) -> Error {
    Error::PermissionDenied(msg.to_string())
}

/// Creates a new resource exhausted error
pub fn resource_exhausted(msg: &str) -> Error {
    Error::ResourceExhausted(msg.to_string())
}

/// Creates a new busy error
pub fn busy(msg: &str) -> Error {
    Error::Busy(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_kind_and_errno() {
        assert_eq!(not_found("pid 9").kind(), ErrorKind::NotFound);
        assert_eq!(not_found("pid 9").errno(), errno::ENOENT);
        assert_eq!(Error::WouldBlock.errno(), errno::EAGAIN);
        assert_eq!(Error::Interrupted.errno(), errno::EINTR);
        assert_eq!(Error::InvariantViolation("x".into()).errno(), errno::EIO);
    }

    #[test]
    fn test_display() {
        assert_eq!(busy("mutex 3").to_string(), "Resource busy: mutex 3");
        assert_eq!(Error::Timeout.to_string(), "Operation timed out");
    }
}
