//! Process-wide runtime state.
//!
//! A single shutdown flag shared by every component. Once set it is never
//! cleared; fast paths (message dispatch, task removal) check it and turn
//! into no-ops so teardown never blocks on in-flight work.

use std::sync::atomic::{AtomicBool, Ordering};

/// Set once at shutdown, never cleared.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Whether the process-wide shutdown has begun.
#[inline]
pub fn is_shutdown() -> bool {
    SHUTDOWN.load(Ordering::Acquire)
}

/// Mark the process as shutting down. Idempotent.
pub fn set_shutdown() {
    SHUTDOWN.store(true, Ordering::Release);
}
