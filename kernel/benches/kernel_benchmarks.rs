//! Kernel benchmarks using Criterion
//!
//! Covers the hot paths of the simulation:
//! - scheduler decisions across policies
//! - address translation with and without TLB hits
//! - syscall dispatch
//! - pipe transfers

use std::hint::black_box;

use akern::vfs::OpenFlags;
use akern::{INIT_PID, Kernel, KernelConfig, ProcessSpec, SchedPolicy, SyscallNumber};
use akern_memory_management::{AccessKind, MmapFlags, PAGE_SIZE, Protection};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn boot() -> Kernel {
    Kernel::new(KernelConfig::default().with_cpus(1)).expect("Failed to boot kernel")
}

/// Scheduling decision with a run queue of `n` tasks under one policy
fn bench_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule");
    for policy in [SchedPolicy::Normal, SchedPolicy::RoundRobin, SchedPolicy::Lottery] {
        for n in [4usize, 64] {
            let kernel = boot();
            for i in 0..n {
                let priority = if policy == SchedPolicy::RoundRobin { 10 } else { 0 };
                let spec = ProcessSpec::new(&format!("task{}", i), INIT_PID).with_policy(policy, priority);
                kernel.create_process_with(spec).expect("Failed to create process");
            }
            group.bench_with_input(BenchmarkId::new(format!("{:?}", policy), n), &n, |b, _| {
                b.iter(|| {
                    kernel.advance_clock(100_000);
                    black_box(kernel.schedule_cpu(0).expect("schedule failed"));
                })
            });
        }
    }
    group.finish();
}

fn bench_translate(c: &mut Criterion) {
    let kernel = boot();
    let pid = kernel.create_process("mapper", INIT_PID).expect("Failed to create process");
    let rw = Protection::READ | Protection::WRITE;
    let vma = kernel
        .mmap_for_process(pid, 0, 64 * PAGE_SIZE, rw, MmapFlags::ANONYMOUS | MmapFlags::POPULATE)
        .expect("mmap failed");

    c.bench_function("translate_address_hot", |b| {
        b.iter(|| black_box(kernel.translate_address(pid, black_box(vma.start)).expect("translate failed")))
    });
    c.bench_function("translate_address_sweep", |b| {
        b.iter(|| {
            for page in 0..64 {
                black_box(kernel.translate_address(pid, vma.start + page * PAGE_SIZE).expect("translate failed"));
            }
        })
    });
    c.bench_function("access_write", |b| {
        b.iter(|| black_box(kernel.access(pid, vma.start + 8, AccessKind::Write).expect("access failed")))
    });
}

fn bench_syscall_dispatch(c: &mut Criterion) {
    let kernel = boot();
    let pid = kernel.create_process("caller", INIT_PID).expect("Failed to create process");
    let getpid = SyscallNumber::Getpid.raw();
    c.bench_function("syscall_getpid", |b| {
        b.iter(|| black_box(kernel.execute_syscall_as(pid, getpid, &[])))
    });

    let flags = (OpenFlags::RDWR | OpenFlags::CREAT).bits() as i64;
    let fd = kernel
        .execute_syscall_as(pid, SyscallNumber::Open.raw(), &["/tmp/bench".into(), flags.into(), 0o644i64.into()])
        .return_value;
    let buf = vec![0xabu8; 512];
    c.bench_function("syscall_write_512", |b| {
        b.iter(|| {
            kernel.execute_syscall_as(pid, SyscallNumber::Lseek.raw(), &[fd.into(), 0i64.into(), 0i64.into()]);
            black_box(kernel.execute_syscall_as(pid, SyscallNumber::Write.raw(), &[fd.into(), buf.clone().into()]))
        })
    });
}

fn bench_pipe_transfer(c: &mut Criterion) {
    let kernel = boot();
    let pid = kernel.create_process("pipe", INIT_PID).expect("Failed to create process");
    let tid = pid;
    let (rfd, wfd) = kernel.pipe_fds(pid, OpenFlags::NONBLOCK).expect("pipe failed");
    let chunk = vec![7u8; 1024];
    c.bench_function("pipe_1kb_round_trip", |b| {
        b.iter(|| {
            kernel.write_descriptor(tid, wfd, &chunk).expect("write failed");
            black_box(kernel.read_descriptor(tid, rfd, chunk.len()).expect("read failed"));
        })
    });
}

criterion_group!(
    kernel_benchmarks,
    bench_schedule,
    bench_translate,
    bench_syscall_dispatch,
    bench_pipe_transfer
);

criterion_main!(kernel_benchmarks);
