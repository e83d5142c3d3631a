//! Identifier and unit aliases used throughout AKern

/// Process identifier
pub type Pid = u32;

/// Thread identifier (the main thread of a process shares its pid)
pub type Tid = u32;

/// User identifier
pub type Uid = u32;

/// Group identifier
pub type Gid = u32;

/// File descriptor number
pub type Fd = i32;

/// Simulated CPU index
pub type CpuId = u32;

/// Time in nanoseconds on the simulated clock
pub type Nanoseconds = u64;

/// Address-space identifier (one per process, equal to its pid)
pub type Asid = u32;

/// The pid of the boot process every orphan is re-parented to
pub const INIT_PID: Pid = 1;

/// The superuser id
pub const ROOT_UID: Uid = 0;

/// Group id of the superuser
pub const ROOT_GID: Gid = 0;
