// =============================================================================
// Torque RT — Coroutine (CRoutine)
// =============================================================================
//
// A CRoutine is a stackful cooperative task: an entry closure, an owned
// stack, and the saved register context to re-enter it. Workers drive it
// with `resume`; the routine gives control back with `yield_now`,
// `hang_up` (wait for data), or `sleep`.
//
// STATE MACHINE:
//   Ready    --resume-->  running  --yield(Sleep)-->     Sleep
//                                  --yield(DataWait)-->  DataWait
//                                  --yield(IoWait)-->    IoWait
//                                  --return-->           Finished
//   Sleep    --wake time reached (update_state)-->       Ready
//   DataWait/IoWait --update flag consumed-->            Ready
//
// SINGLE-RUNNER INVARIANT:
//   At most one thread holds the acquire-lock of a routine at any instant,
//   and only the holder may call `resume` or touch the context, stack, and
//   entry closure. Everything mutable that is not an atomic lives behind
//   that lock.
// =============================================================================

pub mod context;

use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use spin::Lazy;

use crate::base::AtomicRwLock;
use context::{swap_context, RoutineContext, DEFAULT_STACK_SIZE};

/// Lifecycle state of a coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoutineState {
    /// Runnable; a worker may resume it.
    Ready = 0,
    /// Ran to completion (or was force-stopped). Terminal.
    Finished = 1,
    /// Waiting for its wake time to pass.
    Sleep = 2,
    /// Waiting for the I/O poller.
    IoWait = 3,
    /// Waiting for data on a channel.
    DataWait = 4,
}

impl RoutineState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RoutineState::Ready,
            1 => RoutineState::Finished,
            2 => RoutineState::Sleep,
            3 => RoutineState::IoWait,
            _ => RoutineState::DataWait,
        }
    }
}

// ── Per-thread bookkeeping ──────────────────────────────────────

thread_local! {
    /// The routine currently executing on this thread, if any. Set by
    /// `resume` before switching stacks, cleared when the routine yields
    /// back; consulted by the trampoline and the suspension functions.
    static CURRENT: Cell<*const CRoutine> = const { Cell::new(ptr::null()) };

    /// Where this thread's own (main) stack pointer is parked while a
    /// coroutine runs. `resume` saves into it, `yield` loads from it.
    static MAIN_SP: UnsafeCell<*mut u8> = const { UnsafeCell::new(ptr::null_mut()) };
}

/// Process-local monotonic epoch for wake-time arithmetic.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds of steady clock since the process epoch.
#[inline]
pub(crate) fn monotonic_now_ns() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

// ── The coroutine object ────────────────────────────────────────

/// Context, stack, and entry closure; mutated only by the acquire-lock
/// holder.
struct RoutineInner {
    context: RoutineContext,
    /// Taken exactly once, on first entry.
    func: Option<Box<dyn FnOnce() + Send + 'static>>,
}

/// A stackful cooperative task.
pub struct CRoutine {
    /// Stable 64-bit id (hash of the task name).
    id: AtomicU64,
    name: AtomicRwLock<String>,
    group_name: AtomicRwLock<String>,
    /// Scheduling priority in [0, MAX_PRIO).
    priority: AtomicU32,
    /// Hint: which processor last ran (or should run) this routine.
    processor_id: AtomicI32,
    state: AtomicU8,
    /// Absolute wake time, nanoseconds since the process epoch.
    wake_time_ns: AtomicU64,
    /// Set by `stop`; the next resume refuses to run and finishes.
    force_stop: AtomicBool,
    /// The acquire-lock: test-and-set grant of the single-runner right.
    lock: AtomicBool,
    /// One-shot wake signal with inverted sense: `false` means a signal is
    /// pending. Producers clear it (`set_update_flag`, release); the state
    /// reader consumes it by setting it back (`update_state`, acquire).
    updated: AtomicBool,
    inner: UnsafeCell<RoutineInner>,
}

// SAFETY: all fields except `inner` are atomics or internally locked.
// `inner` (context, stack, closure) is only ever touched by the thread
// holding the acquire-lock, which is handed over with acquire/release
// ordering, so there is never concurrent access to it.
unsafe impl Send for CRoutine {}
unsafe impl Sync for CRoutine {}

impl CRoutine {
    /// Creates a routine around `func` with the default 2 MiB stack.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(DEFAULT_STACK_SIZE, func)
    }

    /// Creates a routine around `func` with a caller-chosen stack size.
    pub fn with_stack_size<F>(stack_size: usize, func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            id: AtomicU64::new(0),
            name: AtomicRwLock::new(String::new()),
            group_name: AtomicRwLock::new(String::new()),
            priority: AtomicU32::new(0),
            processor_id: AtomicI32::new(-1),
            state: AtomicU8::new(RoutineState::Ready as u8),
            wake_time_ns: AtomicU64::new(monotonic_now_ns()),
            force_stop: AtomicBool::new(false),
            lock: AtomicBool::new(false),
            // true = no signal pending.
            updated: AtomicBool::new(true),
            inner: UnsafeCell::new(RoutineInner {
                context: RoutineContext::new(stack_size, routine_entry),
                func: Some(Box::new(func)),
            }),
        }
    }

    // ── Single-runner lock ──────────────────────────────────────

    /// Try to take the right to resume this routine.
    #[inline]
    pub fn acquire(&self) -> bool {
        !self.lock.swap(true, Ordering::Acquire)
    }

    /// Give the resume right back.
    #[inline]
    pub fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }

    // ── Wake signal ─────────────────────────────────────────────

    /// Signal that data has arrived for this routine.
    ///
    /// Release ordering: everything written before the signal is visible
    /// to the routine once `update_state` consumes it.
    #[inline]
    pub fn set_update_flag(&self) {
        self.updated.store(false, Ordering::Release);
    }

    /// State-transition reader, called by the pick-next scan while holding
    /// the acquire-lock.
    ///
    /// A due sleeper becomes Ready. Otherwise the one-shot wake signal is
    /// consumed, and if one was pending while the routine waits for data
    /// or I/O, the routine becomes Ready.
    pub fn update_state(&self) -> RoutineState {
        // Synchronous path: sleep expiry.
        if self.state() == RoutineState::Sleep
            && monotonic_now_ns() > self.wake_time_ns.load(Ordering::Relaxed)
        {
            self.set_state(RoutineState::Ready);
            return RoutineState::Ready;
        }

        // Asynchronous path: consume the pending signal, if any.
        if !self.updated.swap(true, Ordering::Acquire) {
            let state = self.state();
            if state == RoutineState::DataWait || state == RoutineState::IoWait {
                self.set_state(RoutineState::Ready);
            }
        }
        self.state()
    }

    // ── Running ─────────────────────────────────────────────────

    /// Run the routine on its own stack until it yields or finishes.
    ///
    /// The caller must hold the acquire-lock and must call from its main
    /// stack (not from inside another coroutine). Returns the routine's
    /// state at the moment it gave control back.
    pub fn resume(&self) -> RoutineState {
        if self.force_stop.load(Ordering::Acquire) {
            self.set_state(RoutineState::Finished);
            return RoutineState::Finished;
        }

        let state = self.state();
        if state != RoutineState::Ready {
            log::warn!("resume on routine {} in state {:?}", self.id(), state);
            return state;
        }

        CURRENT.with(|c| c.set(self as *const CRoutine));
        // SAFETY: the acquire-lock makes us the only thread touching the
        // context, and MAIN_SP is this thread's own slot. Only raw
        // pointers are held across the switch. The swap comes back here
        // when the routine yields or finishes.
        unsafe {
            let sp_slot = (*self.inner.get()).context.sp_slot();
            let main_slot = MAIN_SP.with(|m| m.get());
            swap_context(main_slot, sp_slot);
        }
        CURRENT.with(|c| c.set(ptr::null()));

        self.state()
    }

    /// Suspend the currently running coroutine, recording `state` on it
    /// first. Control transfers back to the worker's `resume` call.
    ///
    /// # Panics
    /// Panics when called outside a coroutine.
    pub fn yield_with(state: RoutineState) {
        Self::switch_out(Some(state));
    }

    fn switch_out(state: Option<RoutineState>) {
        let current = CURRENT.with(|c| c.get());
        assert!(!current.is_null(), "yield called outside a coroutine");
        // SAFETY: CURRENT points at the routine this thread is running;
        // the Arc that owns it is kept alive by the registry and the run
        // queue for as long as the routine can still be resumed.
        let routine = unsafe { &*current };
        if let Some(state) = state {
            routine.set_state(state);
        }
        // SAFETY: we are on this routine's stack and hold its acquire-lock
        // (taken by the resuming worker); the main slot was filled by the
        // matching resume.
        unsafe {
            let sp_slot = (*routine.inner.get()).context.sp_slot();
            let main_slot = MAIN_SP.with(|m| m.get());
            swap_context(sp_slot, main_slot);
        }
    }

    /// Invoke the entry closure. First (and only) call consumes it.
    fn run(&self) {
        // SAFETY: called from the trampoline on the routine's own stack,
        // under the acquire-lock.
        let func = unsafe { (*self.inner.get()).func.take() };
        if let Some(func) = func {
            func();
        }
    }

    // ── Cooperative waits ───────────────────────────────────────

    /// Mark for force-stop: the next scheduling pass finishes the routine
    /// instead of resuming it.
    pub fn stop(&self) {
        self.force_stop.store(true, Ordering::Release);
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn state(&self) -> RoutineState {
        RoutineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: RoutineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.write() = name.to_owned();
    }

    pub fn group_name(&self) -> String {
        self.group_name.read().clone()
    }

    pub fn set_group_name(&self, group_name: &str) {
        *self.group_name.write() = group_name.to_owned();
    }

    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn processor_id(&self) -> i32 {
        self.processor_id.load(Ordering::Relaxed)
    }

    pub fn set_processor_id(&self, processor_id: i32) {
        self.processor_id.store(processor_id, Ordering::Relaxed);
    }

    /// Wake time in nanoseconds since the process epoch (valid while the
    /// routine sleeps).
    pub fn wake_time_ns(&self) -> u64 {
        self.wake_time_ns.load(Ordering::Relaxed)
    }
}

// ── Suspension API for code running inside a coroutine ──────────

/// Give up the processor without changing state; the routine stays Ready
/// and will be picked again by a later scan.
pub fn yield_now() {
    CRoutine::switch_out(None);
}

/// Suspend until data arrives (someone calls `set_update_flag` and the
/// scheduler is notified).
pub fn hang_up() {
    CRoutine::yield_with(RoutineState::DataWait);
}

/// Suspend for at least `duration`. The scheduler will not mark the
/// routine Ready before the wake time passes.
pub fn sleep(duration: Duration) {
    let current = CURRENT.with(|c| c.get());
    assert!(!current.is_null(), "sleep called outside a coroutine");
    // SAFETY: see switch_out.
    let routine = unsafe { &*current };
    let wake = monotonic_now_ns() + duration.as_nanos() as u64;
    routine.wake_time_ns.store(wake, Ordering::Relaxed);
    CRoutine::yield_with(RoutineState::Sleep);
}

/// First-entry trampoline. Runs on the coroutine stack; never returns.
extern "C" fn routine_entry() {
    let current = CURRENT.with(|c| c.get());
    debug_assert!(!current.is_null());
    // SAFETY: resume set CURRENT to the routine being entered just before
    // switching here.
    let routine = unsafe { &*current };
    routine.run();
    // The closure is done. Hand back as Finished; if anything resumes a
    // finished routine again, keep yielding rather than fall off the
    // bottom of the stack.
    loop {
        CRoutine::yield_with(RoutineState::Finished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn resumable(cr: &CRoutine) -> RoutineState {
        assert!(cr.acquire(), "routine should not be acquired elsewhere");
        let state = cr.resume();
        cr.release();
        state
    }

    #[test]
    fn runs_to_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cr = CRoutine::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(cr.state(), RoutineState::Ready);
        assert_eq!(resumable(&cr), RoutineState::Finished);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Finished is terminal; the closure must not run again.
        assert_eq!(resumable(&cr), RoutineState::Finished);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn yield_now_keeps_ready_and_resumes_where_it_left() {
        let stage = Arc::new(AtomicUsize::new(0));
        let s = stage.clone();
        let cr = CRoutine::new(move || {
            s.store(1, Ordering::SeqCst);
            yield_now();
            s.store(2, Ordering::SeqCst);
        });

        assert_eq!(resumable(&cr), RoutineState::Ready);
        assert_eq!(stage.load(Ordering::SeqCst), 1);
        assert_eq!(resumable(&cr), RoutineState::Finished);
        assert_eq!(stage.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hang_up_waits_for_update_flag() {
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        let cr = CRoutine::new(move || {
            hang_up();
            d.store(1, Ordering::SeqCst);
        });

        assert_eq!(resumable(&cr), RoutineState::DataWait);
        // No signal pending: the state reader must not wake it.
        assert_eq!(cr.update_state(), RoutineState::DataWait);

        cr.set_update_flag();
        assert_eq!(cr.update_state(), RoutineState::Ready);
        // The signal is one-shot: consuming it again has no effect on a
        // waiting routine.
        assert_eq!(resumable(&cr), RoutineState::Finished);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sleep_holds_until_wake_time() {
        let cr = CRoutine::new(|| {
            sleep(Duration::from_millis(30));
        });

        let started = Instant::now();
        assert_eq!(resumable(&cr), RoutineState::Sleep);

        // Not due yet: stays asleep.
        assert_eq!(cr.update_state(), RoutineState::Sleep);

        while cr.update_state() != RoutineState::Ready {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(resumable(&cr), RoutineState::Finished);
    }

    #[test]
    fn acquire_is_exclusive() {
        let cr = CRoutine::new(|| {});
        assert!(cr.acquire());
        assert!(!cr.acquire());
        cr.release();
        assert!(cr.acquire());
        cr.release();
    }

    #[test]
    fn force_stop_refuses_to_run() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cr = CRoutine::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        cr.stop();
        assert_eq!(resumable(&cr), RoutineState::Finished);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn routines_move_between_threads() {
        // A routine suspended on one thread may be resumed from another,
        // as long as the acquire-lock hands it over.
        let cr = Arc::new(CRoutine::new(|| {
            yield_now();
        }));

        assert_eq!(resumable(&cr), RoutineState::Ready);

        let cr2 = cr.clone();
        thread::spawn(move || {
            assert_eq!(resumable(&cr2), RoutineState::Finished);
        })
        .join()
        .unwrap();
        assert_eq!(cr.state(), RoutineState::Finished);
    }
}
