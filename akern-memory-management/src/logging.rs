//! Logging shims for the memory subsystem
//!
//! The `mm_*!` macros forward to the `log` facade when the `log` feature
//! is enabled and compile to nothing otherwise, so call sites need no
//! `#[cfg]` of their own.

/// Trace-level memory diagnostics
macro_rules! mm_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::trace!(target: "akern::mm", $($arg)*);
    }
}

/// Debug-level memory diagnostics
macro_rules! mm_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::debug!(target: "akern::mm", $($arg)*);
    }
}

/// Info-level memory diagnostics
#[allow(unused_macros)]
macro_rules! mm_info {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::info!(target: "akern::mm", $($arg)*);
    }
}

/// Warn-level memory diagnostics
macro_rules! mm_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::warn!(target: "akern::mm", $($arg)*);
    }
}
