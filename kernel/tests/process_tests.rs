//! Process and thread life-cycle tests

mod common;

use akern::process::signal::{SIGKILL, SIGTERM, SIGUSR1};
use akern::process::{ProcessState, SigDisposition, SignalOutcome, SignalSet};
use akern::{Error, ErrorKind, INIT_PID, WaitResult};
use proptest::prelude::*;

mod lifecycle_tests {
    use super::*;

    /// A terminated child stays visible as a zombie until its parent reaps it
    #[test]
    fn test_zombie_until_reaped() {
        let kernel = common::kernel();
        let (pid, _) = common::spawn(&kernel, "job");
        kernel.terminate_process(pid, 3).expect("Failed to terminate");
        assert_eq!(kernel.process(pid).unwrap().state, ProcessState::Zombie);

        let reaped = kernel.wait_pid(INIT_PID, pid as i64, false).unwrap().ready();
        assert_eq!(reaped, Some((pid, 3)));
        assert_eq!(kernel.process(pid).unwrap_err().kind(), ErrorKind::NotFound);
    }

    /// A parent already waiting reaps its child the moment it exits
    #[test]
    fn test_waiting_parent_wakes_on_exit() {
        let kernel = common::kernel();
        let (parent, parent_tid) = common::spawn(&kernel, "shell");
        let child = kernel.create_process("cmd", parent).unwrap();

        let token = kernel.wait_pid(parent_tid, -1, false).unwrap().token().unwrap();
        assert_eq!(kernel.process(parent).unwrap().state, ProcessState::Blocked);
        kernel.terminate_process(child, 0).unwrap();
        assert_eq!(kernel.poll_wait(token).unwrap(), Some(WaitResult::Child { pid: child, status: 0 }));
        assert!(kernel.process(child).is_err());
    }

    #[test]
    fn test_nohang_wait_without_zombies() {
        let kernel = common::kernel();
        let (parent, tid) = common::spawn(&kernel, "shell");
        kernel.create_process("cmd", parent).unwrap();
        assert_eq!(kernel.wait_pid(tid, -1, true).unwrap().ready(), Some((0, 0)));
    }

    #[test]
    fn test_orphans_move_to_init() {
        let kernel = common::kernel();
        let (parent, _) = common::spawn(&kernel, "daemon");
        let child = kernel.create_process("worker", parent).unwrap();
        kernel.terminate_process(parent, 0).unwrap();
        assert_eq!(kernel.process(child).unwrap().ppid, INIT_PID);
    }

    #[test]
    fn test_fork_copies_identity() {
        let kernel = common::kernel();
        let user = common::spawn_user(&kernel, "editor", 1000);
        kernel.chdir(user, "/tmp").unwrap();
        let child = kernel.fork_process(user).unwrap();

        let p = kernel.process(child).unwrap();
        assert_eq!(p.ppid, user);
        assert_eq!(p.uid, 1000);
        assert_eq!(p.cwd, "/tmp");
        assert!(kernel.process(user).unwrap().children.contains(&child));
    }

    #[test]
    fn test_exact_pid_is_honored_once() {
        let kernel = common::kernel();
        let spec = akern::ProcessSpec::new("fixed", INIT_PID).with_pid(100);
        assert_eq!(kernel.create_process_with(spec.clone()).unwrap(), 100);
        assert!(matches!(kernel.create_process_with(spec), Err(Error::AlreadyExists(_))));
    }
}

mod signal_tests {
    use super::*;

    #[test]
    fn test_sigterm_terminates_with_status() {
        let kernel = common::kernel();
        let (pid, _) = common::spawn(&kernel, "victim");
        let outcome = kernel.kill_process(INIT_PID, pid, SIGTERM).unwrap();
        assert!(matches!(outcome, SignalOutcome::Terminated(ref r) if r.code == 128 + 15));
        assert_eq!(kernel.wait_pid(INIT_PID, pid as i64, false).unwrap().ready(), Some((pid, 143)));
    }

    #[test]
    fn test_init_cannot_be_killed() {
        let kernel = common::kernel();
        let err = kernel.send_signal(INIT_PID, SIGKILL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(!kernel.process(INIT_PID).unwrap().state.has_exited());
    }

    /// Signalling another user's process needs CAP_KILL
    #[test]
    fn test_cross_user_kill_denied() {
        let kernel = common::kernel();
        let alice = common::spawn_user(&kernel, "alice", 1000);
        let bob = common::spawn_user(&kernel, "bob", 1001);
        let err = kernel.kill_process(alice, bob, SIGTERM).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(kernel.kill_process(INIT_PID, bob, SIGTERM).is_ok());
    }

    #[test]
    fn test_handler_and_mask() {
        let kernel = common::kernel();
        let (pid, _) = common::spawn(&kernel, "server");
        kernel
            .set_signal_disposition(pid, SIGUSR1, SigDisposition::Handler(0x4000))
            .unwrap();

        kernel.set_signal_mask(pid, SignalSet::of(SIGUSR1)).unwrap();
        assert!(matches!(kernel.send_signal(pid, SIGUSR1).unwrap(), SignalOutcome::Pending));

        kernel.set_signal_mask(pid, SignalSet::empty()).unwrap();
        assert_eq!(kernel.take_pending_signal(pid).unwrap(), Some(SIGUSR1));
        assert_eq!(kernel.take_pending_signal(pid).unwrap(), None);
    }

    #[test]
    fn test_kill_cannot_be_caught() {
        let kernel = common::kernel();
        let (pid, _) = common::spawn(&kernel, "stubborn");
        assert!(kernel.set_signal_disposition(pid, SIGKILL, SigDisposition::Ignore).is_err());
    }
}

mod thread_tests {
    use super::*;

    #[test]
    fn test_join_receives_exit_code() {
        let kernel = common::kernel();
        let (pid, main) = common::spawn(&kernel, "threaded");
        let worker = kernel.create_thread(pid, "worker", 0, 0).unwrap();
        assert_eq!(kernel.threads_of(pid).unwrap().len(), 2);

        let token = kernel.join_thread(main, worker).unwrap().token().unwrap();
        kernel.terminate_thread(worker, 5).unwrap();
        assert_eq!(kernel.poll_wait(token).unwrap(), Some(WaitResult::Joined(5)));
    }

    #[test]
    fn test_sleep_wakes_after_deadline() {
        let kernel = common::kernel();
        let (pid, tid) = common::spawn(&kernel, "sleeper");
        let token = kernel.sleep_thread(tid, 1_000).unwrap().token().unwrap();
        assert_eq!(kernel.process(pid).unwrap().state, ProcessState::Sleeping);

        kernel.advance_clock(999);
        assert_eq!(kernel.poll_wait(token).unwrap(), None);
        kernel.advance_clock(1);
        assert_eq!(kernel.poll_wait(token).unwrap(), Some(WaitResult::Slept));
        assert!(kernel.process(pid).unwrap().state.is_runnable());
    }

    /// Exiting a blocked process interrupts its waits
    #[test]
    fn test_exit_interrupts_waiters() {
        let kernel = common::kernel();
        let (pid, tid) = common::spawn(&kernel, "blocked");
        let token = kernel.sleep_thread(tid, 1_000_000).unwrap().token().unwrap();
        kernel.terminate_process(pid, 1).unwrap();
        assert_eq!(kernel.poll_wait(token), Err(Error::Interrupted));
        assert_eq!(kernel.pending_waits(), 0);
    }
}

proptest! {
    /// Every created pid resolves until it is terminated and reaped
    #[test]
    fn prop_created_pids_resolve_until_reaped(count in 1usize..12, reap_mask in any::<u16>()) {
        let kernel = common::kernel();
        let pids: Vec<_> = (0..count)
            .map(|i| kernel.create_process(&format!("p{}", i), INIT_PID).unwrap())
            .collect();
        for pid in &pids {
            prop_assert!(kernel.process(*pid).is_ok());
        }
        for (i, pid) in pids.iter().enumerate() {
            if reap_mask & (1 << i) != 0 {
                kernel.terminate_process(*pid, 0).unwrap();
                prop_assert!(kernel.process(*pid).is_ok());
                kernel.wait_pid(INIT_PID, *pid as i64, false).unwrap();
                prop_assert!(kernel.process(*pid).is_err());
            } else {
                prop_assert!(kernel.process(*pid).is_ok());
            }
        }
    }
}
