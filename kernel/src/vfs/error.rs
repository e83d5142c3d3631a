//! VFS error types

use alloc::string::String;

use akern_api::Error;

/// VFS error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    NotFound,
    PermissionDenied,
    NotDirectory,
    IsDirectory,
    NotEmpty,
    Exists,
    NoSpace,
    InvalidPath,
    NotMounted,
    Busy,
    ReadOnly,
    NotSupported,
    InvalidOperation,
    /// Symlink chain deeper than allowed
    TooManyLinks,
    BadDescriptor,
    TooManyOpenFiles,
    /// Hard link across mounts
    CrossDevice,
    /// Reference counts went out of range
    Corrupted,
}

impl VfsError {
    pub fn describe(self) -> &'static str {
        match self {
            VfsError::NotFound => "no such file or directory",
            VfsError::PermissionDenied => "permission denied",
            VfsError::NotDirectory => "not a directory",
            VfsError::IsDirectory => "is a directory",
            VfsError::NotEmpty => "directory not empty",
            VfsError::Exists => "file exists",
            VfsError::NoSpace => "no space left on device",
            VfsError::InvalidPath => "invalid path",
            VfsError::NotMounted => "not a mount point",
            VfsError::Busy => "device or resource busy",
            VfsError::ReadOnly => "read-only file system",
            VfsError::NotSupported => "operation not supported",
            VfsError::InvalidOperation => "invalid operation",
            VfsError::TooManyLinks => "too many levels of symbolic links",
            VfsError::BadDescriptor => "bad file descriptor",
            VfsError::TooManyOpenFiles => "too many open files",
            VfsError::CrossDevice => "cross-device link",
            VfsError::Corrupted => "file system state corrupted",
        }
    }
}

impl From<VfsError> for Error {
    fn from(err: VfsError) -> Self {
        let msg = String::from(err.describe());
        match err {
            VfsError::NotFound | VfsError::NotMounted | VfsError::BadDescriptor => Error::NotFound(msg),
            VfsError::PermissionDenied | VfsError::ReadOnly => Error::PermissionDenied(msg),
            VfsError::Exists => Error::AlreadyExists(msg),
            VfsError::NoSpace | VfsError::TooManyOpenFiles => Error::ResourceExhausted(msg),
            VfsError::Busy | VfsError::NotEmpty => Error::Busy(msg),
            VfsError::NotSupported => Error::NotImplemented(msg),
            VfsError::Corrupted => Error::InvariantViolation(msg),
            _ => Error::InvalidArgument(msg),
        }
    }
}

pub type VfsResult<T> = Result<T, VfsError>;
