//! Syscall dispatch tests

mod common;

use std::sync::Arc;

use akern_api::error::errno;
use akern::security::SandboxProfile;
use akern::vfs::OpenFlags;
use akern::{
    Blocking, Capabilities, Error, INIT_PID, Kernel, Result, SyscallArg, SyscallContext, SyscallHandler,
    SyscallNumber, SyscallResult, WaitResult, WaitToken,
};
use mockall::mock;

mock! {
    pub Handler {}

    impl SyscallHandler for Handler {
        fn id(&self) -> u32;
        fn name(&self) -> &'static str;
        fn required_capability(&self) -> Option<Capabilities>;
        fn execute(&self, kernel: &Kernel, ctx: &SyscallContext, args: &[SyscallArg]) -> Result<SyscallResult>;
    }
}

fn socket_handler() -> MockHandler {
    let mut handler = MockHandler::new();
    handler.expect_id().return_const(SyscallNumber::Socket.raw());
    handler.expect_name().return_const("socket");
    handler
}

fn call(kernel: &Kernel, pid: u32, number: SyscallNumber, args: Vec<SyscallArg>) -> SyscallResult {
    kernel.execute_syscall_as(pid, number.raw(), &args)
}

mod registration_tests {
    use super::*;

    #[test]
    fn test_registered_handler_runs() {
        let kernel = common::kernel();
        let mut handler = socket_handler();
        handler.expect_required_capability().return_const(None);
        handler
            .expect_execute()
            .withf(|_, ctx, args| ctx.pid == INIT_PID && args == [SyscallArg::Int(2), SyscallArg::Int(1)])
            .times(1)
            .returning(|_, _, _| Ok(SyscallResult::ok(7)));

        assert!(kernel.register_syscall(Arc::new(handler)).is_none());
        let r = call(&kernel, INIT_PID, SyscallNumber::Socket, vec![2i64.into(), 1i64.into()]);
        assert!(r.success);
        assert_eq!(r.return_value, 7);

        let stats = kernel.syscall_stats();
        assert_eq!(stats.calls_by_number.get(&SyscallNumber::Socket.raw()), Some(&1));
        assert_eq!(stats.error_count, 0);
    }

    /// The capability check happens before the handler is entered
    #[test]
    fn test_capability_checked_before_execute() {
        let kernel = common::kernel();
        let mut handler = socket_handler();
        handler
            .expect_required_capability()
            .return_const(Some(Capabilities::NET_ADMIN));
        handler.expect_execute().times(0);
        kernel.register_syscall(Arc::new(handler));

        let user = common::spawn_user(&kernel, "user", 1000);
        let r = call(&kernel, user, SyscallNumber::Socket, Vec::new());
        assert!(!r.success);
        assert_eq!(r.error_code, errno::EACCES);
        assert_eq!(r.return_value, -1);
        assert_eq!(kernel.syscall_stats().errors_by_number.get(&SyscallNumber::Socket.raw()), Some(&1));
    }

    #[test]
    fn test_sandbox_filter_uses_handler_name() {
        let kernel = common::kernel();
        let mut handler = socket_handler();
        handler.expect_required_capability().return_const(None);
        handler.expect_execute().times(0);
        kernel.register_syscall(Arc::new(handler));

        let (pid, _) = common::spawn(&kernel, "offline");
        kernel.install_sandbox_profile(SandboxProfile::new("nosock").deny_syscall("socket"));
        kernel.apply_sandbox("nosock", pid).unwrap();
        assert_eq!(call(&kernel, pid, SyscallNumber::Socket, Vec::new()).error_code, errno::EACCES);
    }

    #[test]
    fn test_handler_errors_become_results() {
        let kernel = common::kernel();
        let mut handler = socket_handler();
        handler.expect_required_capability().return_const(None);
        handler
            .expect_execute()
            .returning(|_, _, _| Err(Error::ResourceExhausted("no sockets left".into())));
        kernel.register_syscall(Arc::new(handler));

        let r = call(&kernel, INIT_PID, SyscallNumber::Socket, Vec::new());
        assert_eq!(r.error_code, errno::ENOMEM);
        assert!(r.error_message.contains("no sockets left"));
    }

    #[test]
    fn test_replacing_a_builtin() {
        let kernel = common::kernel();
        let mut handler = MockHandler::new();
        handler.expect_id().return_const(SyscallNumber::Getpid.raw());
        handler.expect_name().return_const("getpid");
        handler.expect_required_capability().return_const(None);
        handler.expect_execute().returning(|_, _, _| Ok(SyscallResult::ok(4242)));

        assert!(kernel.register_syscall(Arc::new(handler)).is_some());
        assert_eq!(call(&kernel, INIT_PID, SyscallNumber::Getpid, Vec::new()).return_value, 4242);
    }
}

mod builtin_tests {
    use super::*;

    #[test]
    fn test_unknown_and_missing_calls() {
        let kernel = common::kernel();
        assert_eq!(kernel.execute_syscall(9999, &[]).error_code, errno::EINVAL);
        assert_eq!(call(&kernel, INIT_PID, SyscallNumber::Socket, Vec::new()).error_code, errno::ENOSYS);
        assert_eq!(kernel.execute_syscall_as(777, SyscallNumber::Getpid.raw(), &[]).error_code, errno::ENOENT);
    }

    #[test]
    fn test_process_calls() {
        let kernel = common::kernel();
        let (pid, _) = common::spawn(&kernel, "shell");
        assert_eq!(call(&kernel, pid, SyscallNumber::Getpid, Vec::new()).return_value, pid as i64);
        assert_eq!(call(&kernel, pid, SyscallNumber::Getppid, Vec::new()).return_value, INIT_PID as i64);

        let child = call(&kernel, pid, SyscallNumber::Fork, Vec::new()).return_value;
        assert!(child > pid as i64);
        assert!(call(&kernel, child as u32, SyscallNumber::Exit, vec![9i64.into()]).success);

        let r = call(&kernel, pid, SyscallNumber::Waitpid, vec![child.into()]);
        assert_eq!(r.return_value, child);
        assert_eq!(i32::from_le_bytes(r.data[..4].try_into().unwrap()), 9);
    }

    #[test]
    fn test_file_calls() {
        let kernel = common::kernel();
        let (pid, _) = common::spawn(&kernel, "editor");
        let flags = (OpenFlags::RDWR | OpenFlags::CREAT).bits() as i64;
        let fd = call(&kernel, pid, SyscallNumber::Open, vec!["/tmp/todo".into(), flags.into(), 0o644i64.into()]);
        assert!(fd.success);
        let fd = fd.return_value;

        let w = call(&kernel, pid, SyscallNumber::Write, vec![fd.into(), b"buy milk".to_vec().into()]);
        assert_eq!(w.return_value, 8);
        assert!(call(&kernel, pid, SyscallNumber::Lseek, vec![fd.into(), 4i64.into(), 0i64.into()]).success);
        let r = call(&kernel, pid, SyscallNumber::Read, vec![fd.into(), 64i64.into()]);
        assert_eq!(r.data, b"milk");
        assert!(call(&kernel, pid, SyscallNumber::Close, vec![fd.into()]).success);
        assert_eq!(call(&kernel, pid, SyscallNumber::Close, vec![fd.into()]).error_code, errno::ENOENT);
    }

    /// A read on an empty pipe suspends and reports its token
    #[test]
    fn test_blocking_read_returns_token() {
        let kernel = common::kernel();
        let (pid, _) = common::spawn(&kernel, "reader");
        let r = call(&kernel, pid, SyscallNumber::Pipe, Vec::new());
        let rfd = i32::from_le_bytes(r.data[..4].try_into().unwrap());
        let wfd = i32::from_le_bytes(r.data[4..8].try_into().unwrap());

        let r = call(&kernel, pid, SyscallNumber::Read, vec![rfd.into(), 16i64.into()]);
        let token = WaitToken(r.pending.expect("read should block"));
        assert!(r.is_pending());
        assert_eq!(kernel.syscall_stats().pending_count, 1);

        let writer = kernel.create_thread(pid, "writer", 0, 0).unwrap();
        assert_eq!(kernel.write_descriptor(writer, wfd, b"data").unwrap(), Blocking::Ready(4));
        assert_eq!(kernel.poll_wait(token).unwrap(), Some(WaitResult::Bytes(b"data".to_vec())));
    }

    #[test]
    fn test_argument_errors() {
        let kernel = common::kernel();
        let r = call(&kernel, INIT_PID, SyscallNumber::Open, vec![5i64.into()]);
        assert_eq!(r.error_code, errno::EINVAL);
        let r = call(&kernel, INIT_PID, SyscallNumber::Kill, vec![(-3i64).into(), 9i64.into()]);
        assert_eq!(r.error_code, errno::EINVAL);
    }

    #[test]
    fn test_statistics_accumulate() {
        let kernel = common::kernel();
        let before = kernel.syscall_stats().total_calls;
        for _ in 0..5 {
            call(&kernel, INIT_PID, SyscallNumber::Getuid, Vec::new());
        }
        call(&kernel, INIT_PID, SyscallNumber::Close, vec![99i64.into()]);
        let stats = kernel.syscall_stats();
        assert_eq!(stats.total_calls, before + 6);
        assert_eq!(stats.calls_by_number.get(&SyscallNumber::Getuid.raw()), Some(&5));
        assert_eq!(stats.error_count, 1);
    }
}
