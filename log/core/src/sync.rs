//! Atomics behind a loom-swappable seam.
//!
//! Every piece of shared state in the engine synchronizes through the
//! types re-exported here: the tail/committed words of the append path,
//! per-segment liveness counters and state bytes, the cost-benefit cache,
//! and the cleaner's exit flag. Routing them through one module lets the
//! `loom` feature substitute loom's model-checking atomics for the std
//! ones, so the commit protocol in `segment.rs` can be exhaustively
//! permutation-tested (see its `loom_tests` module) while release builds
//! pay nothing.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering, fence};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering, fence};

/// Busy-wait hint for the commit hand-off spin.
///
/// Under loom this must be a real yield: loom only preempts at the
/// synchronization points it knows about, and a raw pause instruction
/// would starve the thread that currently holds the commit window.
#[inline]
pub fn spin_loop() {
    #[cfg(not(feature = "loom"))]
    std::hint::spin_loop();

    #[cfg(feature = "loom")]
    loom::thread::yield_now();
}
