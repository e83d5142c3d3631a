//! Pipes, message queues, semaphores and shared memory through the kernel API

mod common;

use akern::ipc::PipeEnd;
use akern::process::ProcessState;
use akern::{Error, ErrorKind, Kernel, KernelConfig, WaitResult};
use proptest::prelude::*;

fn small_pipes() -> Kernel {
    Kernel::new(KernelConfig::default().with_pipe_capacity(8)).expect("Failed to boot kernel")
}

mod pipe_tests {
    use super::*;

    #[test]
    fn test_read_after_write() {
        let kernel = common::kernel();
        let (pid, tid) = common::spawn(&kernel, "writer");
        let id = kernel.create_pipe(pid).unwrap();

        assert_eq!(kernel.pipe_write(tid, id, &[1, 2, 3, 4, 5], false).unwrap().ready(), Some(5));
        assert_eq!(kernel.pipe_read(tid, id, 3, false).unwrap().ready(), Some(vec![1, 2, 3]));
        assert_eq!(kernel.pipe_read(tid, id, 10, false).unwrap().ready(), Some(vec![4, 5]));
        assert_eq!(kernel.pipe_stats(id).unwrap().buffered, 0);
    }

    /// A reader waiting on an empty pipe is woken by the next write
    #[test]
    fn test_blocked_reader_wakes() {
        let kernel = common::kernel();
        let (pid, reader) = common::spawn(&kernel, "reader");
        let writer = kernel.create_thread(pid, "writer", 0, 0).unwrap();
        let id = kernel.create_pipe(pid).unwrap();

        let token = kernel.pipe_read(reader, id, 16, false).unwrap().token().unwrap();
        assert_eq!(kernel.pipe_stats(id).unwrap().waiting_readers, 1);
        kernel.pipe_write(writer, id, b"ping", false).unwrap();
        assert_eq!(kernel.poll_wait(token).unwrap(), Some(WaitResult::Bytes(b"ping".to_vec())));
    }

    #[test]
    fn test_partial_write_blocks_for_the_rest() {
        let kernel = small_pipes();
        let (pid, writer) = common::spawn(&kernel, "producer");
        let reader = kernel.create_thread(pid, "consumer", 0, 0).unwrap();
        let id = kernel.create_pipe(pid).unwrap();

        let token = kernel.pipe_write(writer, id, b"0123456789ab", false).unwrap().token().unwrap();
        assert_eq!(kernel.pipe_stats(id).unwrap().buffered, 8);
        assert_eq!(kernel.pipe_read(reader, id, 8, false).unwrap().ready(), Some(b"01234567".to_vec()));
        assert_eq!(kernel.poll_wait(token).unwrap(), Some(WaitResult::Written(12)));
        assert_eq!(kernel.pipe_read(reader, id, 8, false).unwrap().ready(), Some(b"89ab".to_vec()));
    }

    #[test]
    fn test_nonblocking_write_stores_what_fits() {
        let kernel = small_pipes();
        let (pid, tid) = common::spawn(&kernel, "producer");
        let id = kernel.create_pipe(pid).unwrap();

        assert_eq!(kernel.pipe_write(tid, id, b"0123456789", true).unwrap().ready(), Some(8));
        assert_eq!(kernel.pipe_write(tid, id, b"x", true), Err(Error::WouldBlock));
        assert_eq!(kernel.pipe_read(tid, id, 0, true).unwrap().ready(), Some(Vec::new()));
    }

    #[test]
    fn test_end_of_file_and_broken_pipe() {
        let kernel = common::kernel();
        let (pid, tid) = common::spawn(&kernel, "lonely");
        let id = kernel.create_pipe(pid).unwrap();
        kernel.pipe_write(tid, id, b"last", false).unwrap();
        kernel.close_pipe(id, PipeEnd::Write).unwrap();
        assert_eq!(kernel.pipe_read(tid, id, 16, false).unwrap().ready(), Some(b"last".to_vec()));
        assert_eq!(kernel.pipe_read(tid, id, 16, false).unwrap().ready(), Some(Vec::new()));

        let (pid, tid) = common::spawn(&kernel, "shouter");
        let id = kernel.create_pipe(pid).unwrap();
        kernel.close_pipe(id, PipeEnd::Read).unwrap();
        assert_eq!(kernel.pipe_write(tid, id, b"anyone?", false), Err(Error::BrokenPipe));
        assert_eq!(kernel.process(pid).unwrap().state, ProcessState::Zombie);
    }

    #[test]
    fn test_named_pipe_outlives_its_ends() {
        let kernel = common::kernel();
        let (pid, tid) = common::spawn(&kernel, "server");
        let id = kernel.create_named_pipe(pid, "jobs").unwrap();
        assert_eq!(kernel.create_named_pipe(pid, "jobs").unwrap_err().kind(), ErrorKind::AlreadyExists);

        assert_eq!(kernel.open_named_pipe("jobs", PipeEnd::Write).unwrap(), id);
        assert_eq!(kernel.open_named_pipe("jobs", PipeEnd::Read).unwrap(), id);
        kernel.pipe_write(tid, id, b"job-1", false).unwrap();
        kernel.close_pipe(id, PipeEnd::Write).unwrap();
        kernel.close_pipe(id, PipeEnd::Read).unwrap();
        assert!(kernel.pipe_stats(id).is_ok());

        kernel.unlink_named_pipe("jobs").unwrap();
        assert_eq!(kernel.pipe_stats(id).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(kernel.open_named_pipe("jobs", PipeEnd::Read).is_err());
    }
}

mod queue_tests {
    use super::*;

    #[test]
    fn test_type_filters() {
        let kernel = common::kernel();
        let (pid, tid) = common::spawn(&kernel, "mail");
        let q = kernel.create_message_queue(pid, Some("mail")).unwrap();
        assert_eq!(kernel.message_queue_by_name("mail").unwrap(), q);

        for (mtype, body) in [(3, "c"), (1, "a"), (2, "b"), (1, "a2")] {
            kernel.send_message(tid, q, mtype, 0, body.as_bytes().to_vec(), false).unwrap();
        }
        let take = |filter| kernel.receive_message(tid, q, filter, true).unwrap().ready().unwrap();

        assert_eq!(take(2).data, b"b");
        assert_eq!(take(-3).data, b"a");
        assert_eq!(take(0).data, b"c");
        assert_eq!(take(1).data, b"a2");
        assert_eq!(kernel.receive_message(tid, q, 0, true).unwrap_err(), Error::WouldBlock);

        let stats = kernel.queue_stats(q).unwrap();
        assert_eq!((stats.sent, stats.received, stats.messages), (4, 4, 0));
    }

    #[test]
    fn test_priority_orders_unfiltered_receive() {
        let kernel = common::kernel();
        let (pid, tid) = common::spawn(&kernel, "urgent");
        let q = kernel.create_message_queue(pid, None).unwrap();
        kernel.send_message(tid, q, 1, 1, b"low".to_vec(), false).unwrap();
        kernel.send_message(tid, q, 1, 9, b"high".to_vec(), false).unwrap();
        kernel.send_message(tid, q, 1, 9, b"high2".to_vec(), false).unwrap();

        let order: Vec<_> = (0..3)
            .map(|_| kernel.receive_message(tid, q, 0, true).unwrap().ready().unwrap().data)
            .collect();
        assert_eq!(order, vec![b"high".to_vec(), b"high2".to_vec(), b"low".to_vec()]);
    }

    #[test]
    fn test_message_type_must_be_positive() {
        let kernel = common::kernel();
        let (pid, tid) = common::spawn(&kernel, "bad");
        let q = kernel.create_message_queue(pid, None).unwrap();
        let err = kernel.send_message(tid, q, 0, 0, Vec::new(), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_blocked_receiver_gets_matching_send() {
        let kernel = common::kernel();
        let (pid, receiver) = common::spawn(&kernel, "rx");
        let sender = kernel.create_thread(pid, "tx", 0, 0).unwrap();
        let q = kernel.create_message_queue(pid, None).unwrap();

        let token = kernel.receive_message(receiver, q, 7, false).unwrap().token().unwrap();
        kernel.send_message(sender, q, 6, 0, b"other".to_vec(), false).unwrap();
        assert_eq!(kernel.poll_wait(token).unwrap(), None);
        kernel.send_message(sender, q, 7, 0, b"mine".to_vec(), false).unwrap();
        assert_eq!(
            kernel.poll_wait(token).unwrap(),
            Some(WaitResult::Message { mtype: 7, data: b"mine".to_vec() })
        );
        assert_eq!(kernel.queue_stats(q).unwrap().messages, 1);
    }

    /// Destroying a queue fails everyone still waiting on it
    #[test]
    fn test_destroy_fails_waiters() {
        let kernel = common::kernel();
        let (pid, tid) = common::spawn(&kernel, "owner");
        let q = kernel.create_message_queue(pid, Some("doomed")).unwrap();
        let token = kernel.receive_message(tid, q, 0, false).unwrap().token().unwrap();

        kernel.destroy_message_queue(pid, q).unwrap();
        assert_eq!(kernel.poll_wait(token).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(kernel.message_queue_by_name("doomed").is_err());
        assert!(kernel.process(pid).unwrap().state.is_runnable());
    }

    #[test]
    fn test_msgget_shares_keys() {
        let kernel = common::kernel();
        let (a, _) = common::spawn(&kernel, "a");
        let (b, _) = common::spawn(&kernel, "b");
        let q = kernel.msgget(a, 4242, true).unwrap();
        assert_eq!(kernel.msgget(b, 4242, false).unwrap(), q);
        assert_eq!(kernel.msgget(b, 4243, false).unwrap_err().kind(), ErrorKind::NotFound);
    }
}

mod semaphore_tests {
    use super::*;

    #[test]
    fn test_wait_blocks_until_post() {
        let kernel = common::kernel();
        let (pid, tid) = common::spawn(&kernel, "sem");
        let sem = kernel.create_semaphore(pid, Some("slots"), 1).unwrap();
        assert_eq!(kernel.semaphore_by_name("slots").unwrap(), sem);

        assert!(kernel.semaphore_wait(tid, sem).unwrap().is_ready());
        assert_eq!(kernel.semaphore_try_wait(sem), Err(Error::WouldBlock));
        let token = kernel.semaphore_wait(tid, sem).unwrap().token().unwrap();
        assert_eq!(kernel.semaphore_stats(sem).unwrap().waiting, 1);

        kernel.semaphore_post(sem).unwrap();
        assert_eq!(kernel.poll_wait(token).unwrap(), Some(WaitResult::Acquired));
        assert_eq!(kernel.semaphore_value(sem).unwrap(), 0);
    }

    #[test]
    fn test_destroy_and_counts() {
        let kernel = common::kernel();
        let (pid, _) = common::spawn(&kernel, "sem");
        let before = kernel.ipc_counts().semaphores;
        let sem = kernel.semget(pid, 99, 3, true).unwrap();
        assert_eq!(kernel.semget(pid, 99, 0, false).unwrap(), sem);
        assert_eq!(kernel.semaphore_value(sem).unwrap(), 3);
        assert_eq!(kernel.ipc_counts().semaphores, before + 1);

        kernel.destroy_semaphore(sem).unwrap();
        assert_eq!(kernel.ipc_counts().semaphores, before);
        assert!(kernel.semaphore_post(sem).is_err());
    }
}

mod shm_tests {
    use super::*;

    /// Two processes attached to one segment see each other's writes
    #[test]
    fn test_segment_shared_between_processes() {
        let kernel = common::kernel();
        let (a, _) = common::spawn(&kernel, "producer");
        let (b, _) = common::spawn(&kernel, "consumer");
        let id = kernel.shmget(a, 1234, 100, true, 0o600).unwrap();
        assert_eq!(kernel.shmget(b, 1234, 0, false, 0).unwrap(), id);
        assert_eq!(kernel.segment_stats(id).unwrap().size, 4096);

        let at_a = kernel.shm_attach(a, id).unwrap();
        kernel.shm_attach(b, id).unwrap();
        assert_eq!(kernel.segment_stats(id).unwrap().attachments, 2);
        assert!(kernel.find_vma(a, at_a).unwrap().is_some());

        kernel.shm_write(a, id, 10, b"hello").unwrap();
        assert_eq!(kernel.shm_read(b, id, 10, 5).unwrap(), b"hello");

        kernel.shm_detach(b, id).unwrap();
        assert_eq!(kernel.shm_read(b, id, 10, 5).unwrap_err().kind(), ErrorKind::PermissionDenied);
        kernel.shm_detach_at(a, at_a).unwrap();
        assert_eq!(kernel.segment_stats(id).unwrap().attachments, 0);
    }

    /// A segment marked for removal goes with its last detach
    #[test]
    fn test_destroy_waits_for_last_detach() {
        let kernel = common::kernel();
        let (pid, _) = common::spawn(&kernel, "owner");
        let id = kernel.shmget(pid, 0, 8192, true, 0o600).unwrap();
        kernel.shm_attach(pid, id).unwrap();

        kernel.destroy_shared_memory(pid, id).unwrap();
        assert!(kernel.segment_stats(id).unwrap().marked_for_deletion);
        kernel.shm_detach(pid, id).unwrap();
        assert_eq!(kernel.segment_stats(id).unwrap_err().kind(), ErrorKind::NotFound);
    }
}

proptest! {
    /// Whatever goes into a pipe comes out unchanged and in order
    #[test]
    fn prop_pipe_preserves_bytes(data in prop::collection::vec(any::<u8>(), 1..4096), chunk in 1usize..512) {
        let kernel = common::kernel();
        let (pid, tid) = common::spawn(&kernel, "pipe");
        let id = kernel.create_pipe(pid).unwrap();
        prop_assert_eq!(kernel.pipe_write(tid, id, &data, true).unwrap().ready(), Some(data.len()));

        let mut out = Vec::new();
        while out.len() < data.len() {
            out.extend(kernel.pipe_read(tid, id, chunk, true).unwrap().ready().unwrap());
        }
        prop_assert_eq!(out, data);
        prop_assert_eq!(kernel.pipe_stats(id).unwrap().buffered, 0);
    }

    /// Non-blocking waits and posts never create or lose units
    #[test]
    fn prop_semaphore_conserves_units(initial in 0u32..8, ops in prop::collection::vec(any::<bool>(), 0..64)) {
        let kernel = common::kernel();
        let (pid, _) = common::spawn(&kernel, "sem");
        let sem = kernel.create_semaphore(pid, None, initial).unwrap();
        let mut model = initial;
        let mut taken = 0u32;
        for post in ops {
            if post {
                kernel.semaphore_post(sem).unwrap();
                model += 1;
            } else if model > 0 {
                prop_assert!(kernel.semaphore_try_wait(sem).is_ok());
                model -= 1;
                taken += 1;
            } else {
                prop_assert_eq!(kernel.semaphore_try_wait(sem), Err(Error::WouldBlock));
            }
            prop_assert_eq!(kernel.semaphore_value(sem).unwrap(), model);
        }
        for _ in 0..taken {
            kernel.semaphore_post(sem).unwrap();
        }
        prop_assert!(kernel.semaphore_value(sem).unwrap() >= initial);
    }
}
