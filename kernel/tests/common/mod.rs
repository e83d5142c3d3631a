//! Common helpers for kernel integration tests

#![allow(dead_code)]

use akern::{INIT_PID, Kernel, KernelConfig, Pid, ProcessSpec, Tid};

/// Kernel with the default configuration
pub fn kernel() -> Kernel {
    Kernel::new(KernelConfig::default()).expect("Failed to boot kernel")
}

/// Single-CPU kernel, for deterministic scheduling
pub fn uniprocessor() -> Kernel {
    Kernel::new(KernelConfig::default().with_cpus(1)).expect("Failed to boot kernel")
}

/// Root-owned child of init; returns its pid and main thread
pub fn spawn(kernel: &Kernel, name: &str) -> (Pid, Tid) {
    let pid = kernel.create_process(name, INIT_PID).expect("Failed to create process");
    (pid, pid)
}

/// Unprivileged child of init
pub fn spawn_user(kernel: &Kernel, name: &str, uid: u32) -> Pid {
    kernel
        .create_process_with(ProcessSpec::new(name, INIT_PID).with_credentials(uid, uid))
        .expect("Failed to create user process")
}
