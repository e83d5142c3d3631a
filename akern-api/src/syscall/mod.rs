//! Syscall vocabulary shared by the dispatcher and its callers

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::Error;

mod numbers;

pub use numbers::{SyscallNumber, MAX_SYSCALL};

/// One syscall argument
///
/// Paths and names travel as strings, buffers as bytes; everything else is
/// an integer (descriptors, flags, addresses, pids).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallArg {
    /// Integer argument
    Int(i64),
    /// String argument
    Str(String),
    /// Byte buffer argument
    Bytes(Vec<u8>),
}

impl SyscallArg {
    /// Integer value, if this is an integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SyscallArg::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// String value, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SyscallArg::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Byte value; strings are viewed as their UTF-8 bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SyscallArg::Bytes(b) => Some(b.as_slice()),
            SyscallArg::Str(s) => Some(s.as_bytes()),
            SyscallArg::Int(_) => None,
        }
    }
}

impl From<i64> for SyscallArg {
    fn from(v: i64) -> Self {
        SyscallArg::Int(v)
    }
}

impl From<i32> for SyscallArg {
    fn from(v: i32) -> Self {
        SyscallArg::Int(v as i64)
    }
}

impl From<u32> for SyscallArg {
    fn from(v: u32) -> Self {
        SyscallArg::Int(v as i64)
    }
}

impl From<u64> for SyscallArg {
    fn from(v: u64) -> Self {
        SyscallArg::Int(v as i64)
    }
}

impl From<&str> for SyscallArg {
    fn from(v: &str) -> Self {
        SyscallArg::Str(v.to_string())
    }
}

impl From<String> for SyscallArg {
    fn from(v: String) -> Self {
        SyscallArg::Str(v)
    }
}

impl From<Vec<u8>> for SyscallArg {
    fn from(v: Vec<u8>) -> Self {
        SyscallArg::Bytes(v)
    }
}

impl From<&[u8]> for SyscallArg {
    fn from(v: &[u8]) -> Self {
        SyscallArg::Bytes(v.to_vec())
    }
}

/// Structured outcome of one dispatched syscall
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyscallResult {
    /// Return value (`-1` on failure)
    pub return_value: i64,
    /// errno, `0` on success
    pub error_code: i32,
    /// Human readable error, empty on success
    pub error_message: String,
    /// Whether the call succeeded
    pub success: bool,
    /// Bytes produced by read-style calls
    pub data: Vec<u8>,
    /// Wait token when the call blocked instead of completing
    pub pending: Option<u64>,
}

impl SyscallResult {
    /// Successful result with a return value
    pub fn ok(return_value: i64) -> Self {
        Self {
            return_value,
            success: true,
            ..Default::default()
        }
    }

    /// Successful result carrying bytes
    pub fn with_data(return_value: i64, data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::ok(return_value)
        }
    }

    /// The call blocked; the caller should poll `token`
    pub fn pending(token: u64) -> Self {
        Self {
            pending: Some(token),
            ..Self::ok(0)
        }
    }

    /// Failed result mapped from an error
    pub fn from_error(err: &Error) -> Self {
        Self {
            return_value: -1,
            error_code: err.errno(),
            error_message: err.to_string(),
            success: false,
            data: Vec::new(),
            pending: None,
        }
    }

    /// Whether the call is waiting on a token
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_lookup() {
        assert_eq!(SyscallNumber::from_raw(0), Some(SyscallNumber::Exit));
        assert_eq!(SyscallNumber::from_raw(50), Some(SyscallNumber::Open));
        assert_eq!(SyscallNumber::from_raw(150), Some(SyscallNumber::Mmap));
        assert_eq!(SyscallNumber::from_raw(29), None);
        assert_eq!(SyscallNumber::from_name("clock_gettime"), Some(SyscallNumber::ClockGettime));
        assert_eq!(SyscallNumber::Shmat.name(), "shmat");
    }

    #[test]
    fn test_error_result() {
        let r = SyscallResult::from_error(&Error::WouldBlock);
        assert!(!r.success);
        assert_eq!(r.return_value, -1);
        assert_eq!(r.error_code, crate::error::errno::EAGAIN);
    }
}
