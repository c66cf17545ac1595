//! Fixed-size concurrent hash map.
//!
//! A flat table of `TABLE_SIZE` buckets (power of two, enforced at compile
//! time), each a short insertion-ordered list under its own
//! [`AtomicRwLock`]. There is no resizing and no rehashing: the bucket for
//! a key is always `key & (TABLE_SIZE - 1)`, so operations on different
//! buckets never contend. Used for hot integral-keyed indexes such as the
//! channel and task name registries.

use super::atomic_rw_lock::AtomicRwLock;

/// Integral key types usable with [`ConcurrentHashMap`].
///
/// The bucket index is derived by masking the key's low bits, which only
/// makes sense for integer-like keys (channel ids, coroutine ids).
pub trait IntKey: Copy + Eq {
    /// The key as a raw 64-bit value for bucket masking.
    fn as_u64(self) -> u64;
}

macro_rules! impl_int_key {
    ($($t:ty),*) => {
        $(impl IntKey for $t {
            #[inline]
            fn as_u64(self) -> u64 {
                self as u64
            }
        })*
    };
}

impl_int_key!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

/// One bucket: an insertion-ordered `(key, value)` list under a
/// reader/writer lock.
struct Bucket<K, V> {
    entries: AtomicRwLock<Vec<(K, V)>>,
}

impl<K: IntKey, V: Clone> Bucket<K, V> {
    fn new() -> Self {
        Self {
            entries: AtomicRwLock::new(Vec::new()),
        }
    }

    fn has(&self, key: K) -> bool {
        self.entries.read().iter().any(|(k, _)| *k == key)
    }

    fn get(&self, key: K) -> Option<V> {
        self.entries
            .read()
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
    }

    /// Insert or overwrite. Within a bucket, first insertion fixes the
    /// entry's position; overwrites keep it.
    fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => entries.push((key, value)),
        }
    }

    fn erase(&self, key: K) -> bool {
        let mut entries = self.entries.write();
        match entries.iter().position(|(k, _)| *k == key) {
            Some(idx) => {
                entries.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// Fixed-size concurrent hash map for integral keys.
///
/// `TABLE_SIZE` must be a power of two; violating that is a compile-time
/// error at the first use of the instantiation.
pub struct ConcurrentHashMap<K, V, const TABLE_SIZE: usize = 128> {
    table: [Bucket<K, V>; TABLE_SIZE],
}

impl<K: IntKey, V: Clone, const TABLE_SIZE: usize> ConcurrentHashMap<K, V, TABLE_SIZE> {
    /// Compile-time table size check (evaluated when `new` is instantiated).
    const TABLE_SIZE_IS_POWER_OF_TWO: () =
        assert!(TABLE_SIZE > 0 && TABLE_SIZE & (TABLE_SIZE - 1) == 0);

    /// Bucket mask: index = key & mask.
    const MASK: u64 = (TABLE_SIZE - 1) as u64;

    pub fn new() -> Self {
        let () = Self::TABLE_SIZE_IS_POWER_OF_TWO;
        Self {
            table: std::array::from_fn(|_| Bucket::new()),
        }
    }

    #[inline]
    fn bucket(&self, key: K) -> &Bucket<K, V> {
        &self.table[(key.as_u64() & Self::MASK) as usize]
    }

    /// Whether `key` is present.
    pub fn has(&self, key: K) -> bool {
        self.bucket(key).has(key)
    }

    /// Copy of the value stored under `key`, if any.
    pub fn get(&self, key: K) -> Option<V> {
        self.bucket(key).get(key)
    }

    /// Insert `value` under `key`, overwriting any existing entry.
    pub fn set(&self, key: K, value: V) {
        self.bucket(key).insert(key, value);
    }

    /// Remove `key`. Returns whether an entry was removed.
    pub fn erase(&self, key: K) -> bool {
        self.bucket(key).erase(key)
    }
}

impl<K: IntKey, V: Clone, const TABLE_SIZE: usize> Default
    for ConcurrentHashMap<K, V, TABLE_SIZE>
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_then_get_returns_last_written() {
        let map: ConcurrentHashMap<u64, i32> = ConcurrentHashMap::new();
        assert!(!map.has(3));
        assert_eq!(map.get(3), None);

        map.set(3, 30);
        assert!(map.has(3));
        assert_eq!(map.get(3), Some(30));

        map.set(3, 31);
        assert_eq!(map.get(3), Some(31));
    }

    #[test]
    fn erase_removes_only_its_key() {
        let map: ConcurrentHashMap<u64, i32> = ConcurrentHashMap::new();
        // 5 and 133 share bucket 5 when TABLE_SIZE = 128.
        map.set(5, 50);
        map.set(133, 60);

        assert!(map.erase(5));
        assert!(!map.has(5));
        assert_eq!(map.get(133), Some(60));
        assert!(!map.erase(5));
    }

    #[test]
    fn keys_land_in_masked_bucket() {
        // Colliding keys (k, k + 128, k + 256) must all remain reachable:
        // they live in the same bucket list.
        let map: ConcurrentHashMap<u64, u64> = ConcurrentHashMap::new();
        for k in [7u64, 7 + 128, 7 + 256] {
            map.set(k, k * 10);
        }
        for k in [7u64, 7 + 128, 7 + 256] {
            assert_eq!(map.get(k), Some(k * 10));
        }
    }

    #[test]
    fn concurrent_writers_and_readers() {
        const WRITERS: u64 = 8;
        const PER_WRITER: u64 = 12_500; // 100k keys total, disjoint ranges

        let map: Arc<ConcurrentHashMap<u64, u64>> = Arc::new(ConcurrentHashMap::new());
        let mut handles = Vec::new();

        for w in 0..WRITERS {
            let m = map.clone();
            handles.push(thread::spawn(move || {
                let base = w * PER_WRITER;
                for i in base..base + PER_WRITER {
                    m.set(i, i);
                }
            }));
        }
        for w in 0..WRITERS {
            let m = map.clone();
            handles.push(thread::spawn(move || {
                let base = w * PER_WRITER;
                // Spin until every key written by the matching writer is
                // visible with its final value.
                for i in base..base + PER_WRITER {
                    loop {
                        match m.get(i) {
                            Some(v) => {
                                assert_eq!(v, i);
                                break;
                            }
                            None => std::hint::spin_loop(),
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.get(0), Some(0));
        assert_eq!(map.get(WRITERS * PER_WRITER - 1), Some(WRITERS * PER_WRITER - 1));
    }
}
