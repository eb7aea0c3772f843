//! Out-of-memory policies.
//!
//! Consulted by the facade once the creation policy returned null for a non-zero
//! request. None of them allocates.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[cfg(feature = "log")]
use log::error;

use crate::{OomPolicy, ThreadContext};

/// Hands the null pointer back to the caller, who has to check it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReturnNull;

impl OomPolicy for ReturnNull {
    fn handle_oom<T: ThreadContext + ?Sized>(&self, _ctx: &T, _bytes: usize) -> *mut u8 {
        ptr::null_mut()
    }

    fn classname() -> &'static str {
        "ReturnNull"
    }
}

/// Returns null and raises a flag the host can poll after a kernel finished.
#[derive(Debug, Default)]
pub struct RecordFailure {
    failed: AtomicBool,
    failures: AtomicUsize,
    largest_request: AtomicUsize,
}

impl RecordFailure {
    pub const fn new() -> Self {
        Self {
            failed: AtomicBool::new(false),
            failures: AtomicUsize::new(0),
            largest_request: AtomicUsize::new(0),
        }
    }

    /// Whether any request failed since the last [`RecordFailure::clear`].
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Largest failed request in bytes.
    pub fn largest_request(&self) -> usize {
        self.largest_request.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.failures.store(0, Ordering::Relaxed);
        self.largest_request.store(0, Ordering::Relaxed);
        self.failed.store(false, Ordering::Release);
    }
}

impl OomPolicy for RecordFailure {
    fn handle_oom<T: ThreadContext + ?Sized>(&self, _ctx: &T, bytes: usize) -> *mut u8 {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.largest_request.fetch_max(bytes, Ordering::Relaxed);
        self.failed.store(true, Ordering::Release);
        ptr::null_mut()
    }

    fn classname() -> &'static str {
        "RecordFailure"
    }
}

/// Panics on exhaustion, the host-side analogue of a bad-alloc exception.
///
/// Only usable where unwinding or aborting the worker is acceptable.
#[derive(Debug, Clone, Copy, Default)]
pub struct Abort;

impl OomPolicy for Abort {
    fn handle_oom<T: ThreadContext + ?Sized>(&self, ctx: &T, bytes: usize) -> *mut u8 {
        error!(
            "out of memory: worker {} requested {} bytes",
            ctx.thread_id(),
            bytes
        );
        panic!("out of memory: request of {} bytes failed", bytes);
    }

    fn classname() -> &'static str {
        "Abort"
    }
}
