//! Hot-path logging macros
//!
//! Transfer chunks and streamed tokens log at debug/trace level in debug
//! builds only. Release builds compile the calls away.

/// Debug log for per-transfer and per-request events (debug builds only)
#[cfg(debug_assertions)]
#[macro_export]
macro_rules! perf_debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}

#[cfg(not(debug_assertions))]
#[macro_export]
macro_rules! perf_debug {
    ($($arg:tt)*) => {};
}

/// Trace log for per-chunk and per-token events (debug builds only)
#[cfg(debug_assertions)]
#[macro_export]
macro_rules! perf_trace {
    ($($arg:tt)*) => { log::trace!($($arg)*) };
}

#[cfg(not(debug_assertions))]
#[macro_export]
macro_rules! perf_trace {
    ($($arg:tt)*) => {};
}
