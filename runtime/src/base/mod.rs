//! Concurrency primitives the runtime is built from.
//!
//! Lock ordering rule: a run-queue lock may be taken while holding the id
//! registry lock (dispatch, removal), never the other way around.

pub mod atomic_rw_lock;
pub mod concurrent_hash_map;

pub use atomic_rw_lock::{AtomicRwLock, ReadGuard, WriteGuard};
pub use concurrent_hash_map::ConcurrentHashMap;
