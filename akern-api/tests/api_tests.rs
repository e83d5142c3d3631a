//! Integration tests for the shared API types

use akern_api::error::errno;
use akern_api::{Capabilities, Error, ErrorKind, SyscallArg, SyscallNumber, SyscallResult};

#[test]
fn test_every_kind_has_distinct_errno() {
    let errors = [
        Error::ResourceExhausted("pages".into()),
        Error::NotFound("pid".into()),
        Error::PermissionDenied("cap".into()),
        Error::InvalidArgument("len".into()),
        Error::WouldBlock,
        Error::Timeout,
        Error::AlreadyExists("path".into()),
        Error::Interrupted,
        Error::Busy("mount".into()),
        Error::BrokenPipe,
        Error::NotImplemented("socket".into()),
        Error::InvariantViolation("refcount".into()),
    ];
    let mut codes: Vec<i32> = errors.iter().map(|e| e.errno()).collect();
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), errors.len());
}

#[test]
fn test_syscall_result_mapping() {
    let err = Error::PermissionDenied("NET_ADMIN".into());
    let result = SyscallResult::from_error(&err);
    assert_eq!(result.error_code, errno::EACCES);
    assert!(result.error_message.contains("NET_ADMIN"));
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    let ok = SyscallResult::with_data(3, vec![1, 2, 3]);
    assert!(ok.success);
    assert_eq!(ok.error_code, 0);
    assert_eq!(ok.data, vec![1, 2, 3]);
}

#[test]
fn test_syscall_table_is_consistent() {
    for number in SyscallNumber::ALL {
        assert_eq!(SyscallNumber::from_raw(number.raw()), Some(*number));
        assert_eq!(SyscallNumber::from_name(number.name()), Some(*number));
    }
    assert_eq!(SyscallNumber::ArchPrctl.raw(), 28);
    assert_eq!(SyscallNumber::Msgget.raw(), 200);
    assert_eq!(SyscallNumber::Uname.raw(), 350);
    assert_eq!(SyscallNumber::Faccessat2.raw(), 466);
}

#[test]
fn test_arg_conversions() {
    assert_eq!(SyscallArg::from(7i32).as_int(), Some(7));
    assert_eq!(SyscallArg::from("/tmp").as_str(), Some("/tmp"));
    assert_eq!(SyscallArg::from("ab").as_bytes(), Some(&b"ab"[..]));
    assert_eq!(SyscallArg::from(vec![9u8]).as_int(), None);
}

#[test]
fn test_capability_union() {
    let caps = Capabilities::KILL | Capabilities::NET_ADMIN;
    assert!(caps.grants(Capabilities::NET_ADMIN));
    assert!(!caps.grants(Capabilities::SYS_ADMIN));
    assert!(!caps.grants(Capabilities::NET_ADMIN | Capabilities::SYS_ADMIN));
}
