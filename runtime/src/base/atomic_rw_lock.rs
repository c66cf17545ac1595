// =============================================================================
// Torque RT — Atomic Reader/Writer Lock
// =============================================================================
//
// A writer-preferring reader/writer lock built from a single 32-bit atomic
// word, used to protect the scheduler's read-mostly maps (run queues, id
// registry, channel tables).
//
// WORD LAYOUT:
//   - Bit 31: writer active
//   - Bits 0..31: reader count
//
// A separate counter tracks waiting writers. Readers back off while any
// writer is waiting or active, so a stream of readers cannot starve a
// writer that is trying to mutate a run queue.
//
// SPIN POLICY:
//   Contended paths spin with a CPU relax hint for a small bounded number
//   of iterations, then fall back to thread::yield_now(). Critical sections
//   under this lock are short (queue push, map lookup), so the spin bound
//   is almost always enough.
// =============================================================================

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

/// Writer-active flag in the high bit of the lock word.
const WRITER_ACTIVE: u32 = 1 << 31;

/// Contended acquisitions spin this many times before yielding the thread.
const SPIN_LIMIT: u32 = 5;

/// A writer-preferring reader/writer lock that owns its data.
///
/// Readers share the lock; a writer gets exclusive access. While a writer
/// is waiting, new readers back off, which bounds writer latency under
/// reader-heavy loads (the common case for the scheduler's maps).
pub struct AtomicRwLock<T: ?Sized> {
    /// Bit 31 = writer active, low bits = reader count.
    word: AtomicU32,

    /// Number of writers currently waiting to acquire.
    writer_wait: AtomicU32,

    /// The protected data. UnsafeCell is required because we hand out
    /// references through a shared `&self`; the word above enforces the
    /// reader/writer discipline at runtime.
    data: UnsafeCell<T>,
}

// SAFETY: the lock word serializes access to `data`. Sharing the lock
// across threads is sound whenever the protected value itself may move
// between threads.
unsafe impl<T: ?Sized + Send> Send for AtomicRwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for AtomicRwLock<T> {}

impl<T> AtomicRwLock<T> {
    /// Creates a new unlocked lock wrapping `value`.
    ///
    /// Const so locks can be used in statics.
    pub const fn new(value: T) -> Self {
        Self {
            word: AtomicU32::new(0),
            writer_wait: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Consumes the lock and returns the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> AtomicRwLock<T> {
    /// Acquires the lock for shared read access.
    ///
    /// Blocks (spin, then yield) while a writer is active or waiting.
    pub fn read(&self) -> ReadGuard<'_, T> {
        let mut spins = 0u32;
        loop {
            // Back off while a writer is waiting or active. Writers take
            // priority over new readers.
            if self.writer_wait.load(Ordering::Acquire) == 0 {
                let prev = self.word.fetch_add(1, Ordering::Acquire);
                if prev & WRITER_ACTIVE == 0 {
                    return ReadGuard { lock: self };
                }
                // A writer slipped in between the check and the increment;
                // undo our reservation and retry.
                self.word.fetch_sub(1, Ordering::Release);
            }
            relax(&mut spins);
        }
    }

    /// Acquires the lock for exclusive write access.
    ///
    /// Registers as a waiting writer first so in-flight readers drain and
    /// new readers hold off.
    pub fn write(&self) -> WriteGuard<'_, T> {
        self.writer_wait.fetch_add(1, Ordering::AcqRel);
        let mut spins = 0u32;
        loop {
            // Acquire succeeds only from the fully idle state: no readers,
            // no other writer.
            if self
                .word
                .compare_exchange_weak(0, WRITER_ACTIVE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.writer_wait.fetch_sub(1, Ordering::Release);
                return WriteGuard { lock: self };
            }
            relax(&mut spins);
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Safe without locking: `&mut self` already guarantees exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for AtomicRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Spin with a relax hint up to `SPIN_LIMIT`, then yield the OS thread.
#[inline]
fn relax(spins: &mut u32) {
    if *spins < SPIN_LIMIT {
        *spins += 1;
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

/// RAII guard for shared read access.
///
/// While any ReadGuard exists, no writer can enter. Dropping the guard
/// decrements the reader count.
pub struct ReadGuard<'a, T: ?Sized> {
    lock: &'a AtomicRwLock<T>,
}

impl<T: ?Sized> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: reader count > 0 excludes writers; shared reads of the
        // protected data are the only access possible through this guard.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        // Release ordering publishes any reads-before-unlock relationship
        // to the next writer.
        self.lock.word.fetch_sub(1, Ordering::Release);
    }
}

/// RAII guard for exclusive write access.
pub struct WriteGuard<'a, T: ?Sized> {
    lock: &'a AtomicRwLock<T>,
}

impl<T: ?Sized> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the writer-active bit excludes all other access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the writer-active bit excludes all other access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        // Clearing the writer bit releases all writes made under the guard.
        self.lock.word.fetch_and(!WRITER_ACTIVE, Ordering::Release);
    }
}
