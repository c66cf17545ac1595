//! Stable name→id hashing and the process-wide name registries.
//!
//! Task and channel names are addressed everywhere else by a 64-bit id.
//! The hash must be stable across runs and processes (ids appear in perf
//! trace files and on the wire), so we use FNV-1a rather than the standard
//! library's randomized hasher.

use spin::Lazy;

use crate::base::ConcurrentHashMap;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// id → registered task name.
static TASK_NAMES: Lazy<ConcurrentHashMap<u64, String>> = Lazy::new(ConcurrentHashMap::new);

/// id → registered channel name.
static CHANNEL_NAMES: Lazy<ConcurrentHashMap<u64, String>> = Lazy::new(ConcurrentHashMap::new);

/// Stable 64-bit FNV-1a hash of `name`.
pub fn hash_id(name: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Register `name` as a task and return its id.
///
/// Re-registering the same name is fine; a different name hashing to the
/// same id is logged and the later name wins.
pub fn register_task_name(name: &str) -> u64 {
    register(&TASK_NAMES, name)
}

/// Register `name` as a channel and return its id.
pub fn register_channel(name: &str) -> u64 {
    register(&CHANNEL_NAMES, name)
}

/// Registered task name for `id`, if any.
pub fn task_name(id: u64) -> Option<String> {
    TASK_NAMES.get(id)
}

/// Registered channel name for `id`, if any.
pub fn channel_name(id: u64) -> Option<String> {
    CHANNEL_NAMES.get(id)
}

fn register(table: &ConcurrentHashMap<u64, String>, name: &str) -> u64 {
    let id = hash_id(name);
    if let Some(existing) = table.get(id) {
        if existing != name {
            log::warn!("name hash collision: {:?} vs {:?} (id {})", name, existing, id);
        }
    }
    table.set(id, name.to_owned());
    id
}
