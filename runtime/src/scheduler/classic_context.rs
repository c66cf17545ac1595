// =============================================================================
// Torque RT — Classic Scheduling Context
// =============================================================================
//
// The classic policy keeps, per group, MAX_PRIO run queues shared by the
// group's processors, plus one parking lot (mutex + condvar). A context is
// one processor's view of its group: the pick-next scan, the park/unpark
// handshake, and the sleep-deadline it learned during its last scan.
//
// PICK-NEXT:
//   Scan priorities high to low, each queue head to tail. A routine whose
//   acquire-lock is taken is being handled by another processor: skip it.
//   Otherwise let update_state() decide; the first Ready routine wins and
//   is returned still acquired (the processor releases after resuming).
//
// SELECTION ORDER GUARANTEES:
//   Strict priority across queues; FIFO within a queue. Low priorities can
//   starve under sustained high-priority load.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use spin::Lazy;

use crate::base::AtomicRwLock;
use crate::croutine::{monotonic_now_ns, CRoutine, RoutineState};
use crate::event::{PerfEventCache, SchedPerf};

/// Number of priority levels; valid priorities are `0..MAX_PRIO`, with
/// `MAX_PRIO - 1` scanned first.
pub const MAX_PRIO: usize = 20;

type RoutineQueue = VecDeque<Arc<CRoutine>>;

/// Park-state shared by a group's processors.
struct WaitQueue {
    /// A notify arrived while nobody (or somebody) was parked; the next
    /// wait consumes it instead of sleeping. Closes the window between an
    /// empty scan and the park.
    notified: bool,
}

/// Everything a group's processors share.
pub struct GroupState {
    /// One FIFO queue per priority, each under its own lock.
    run_queues: [AtomicRwLock<RoutineQueue>; MAX_PRIO],
    wait_queue: Mutex<WaitQueue>,
    wait_cv: Condvar,
}

impl GroupState {
    fn new() -> Self {
        Self {
            run_queues: std::array::from_fn(|_| AtomicRwLock::new(VecDeque::new())),
            wait_queue: Mutex::new(WaitQueue { notified: false }),
            wait_cv: Condvar::new(),
        }
    }

    /// Append `cr` at the tail of the priority's queue.
    pub fn enqueue(&self, prio: usize, cr: Arc<CRoutine>) {
        self.run_queues[prio].write().push_back(cr);
    }

    /// Remove the routine with `crid` from the priority's queue.
    ///
    /// The removed routine is force-stopped and its acquire-lock released
    /// so a processor that lost the race to it does not wedge it forever.
    pub fn remove(&self, prio: usize, crid: u64) -> bool {
        let mut queue = self.run_queues[prio].write();
        match queue.iter().position(|cr| cr.id() == crid) {
            Some(index) => {
                if let Some(cr) = queue.remove(index) {
                    cr.stop();
                    cr.release();
                }
                true
            }
            None => false,
        }
    }

    /// Whether `crid` sits in the priority's queue. Test support.
    #[cfg(test)]
    pub fn contains(&self, prio: usize, crid: u64) -> bool {
        self.run_queues[prio].read().iter().any(|cr| cr.id() == crid)
    }
}

/// Process-wide group registry. Groups are created on first reference and
/// live for the process; contexts, the façade, and notify callbacks all
/// reach a group through its name.
static GROUPS: Lazy<AtomicRwLock<HashMap<String, Arc<GroupState>>>> =
    Lazy::new(|| AtomicRwLock::new(HashMap::new()));

/// The shared state of `group_name`, created on demand.
pub fn group_state(group_name: &str) -> Arc<GroupState> {
    if let Some(group) = GROUPS.read().get(group_name) {
        return group.clone();
    }
    let mut groups = GROUPS.write();
    groups
        .entry(group_name.to_owned())
        .or_insert_with(|| Arc::new(GroupState::new()))
        .clone()
}

/// One processor's handle on its group.
pub struct ClassicContext {
    group_name: String,
    group: Arc<GroupState>,
    stop: AtomicBool,
    /// The last scan saw at least one sleeper; `wake_time_ns` bounds the
    /// next park.
    need_sleep: AtomicBool,
    /// Earliest wake time seen during the last scan.
    wake_time_ns: AtomicU64,
}

impl ClassicContext {
    pub fn new(group_name: &str) -> Self {
        Self {
            group_name: group_name.to_owned(),
            group: group_state(group_name),
            stop: AtomicBool::new(false),
            need_sleep: AtomicBool::new(false),
            wake_time_ns: AtomicU64::new(0),
        }
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Pick the next runnable routine, or nothing if every queue is empty
    /// of ready work.
    ///
    /// The returned routine is acquired; the caller resumes it and then
    /// releases.
    pub fn next_routine(&self) -> Option<Arc<CRoutine>> {
        if self.stop.load(Ordering::Acquire) {
            return None;
        }

        for prio in (0..MAX_PRIO).rev() {
            let queue = self.group.run_queues[prio].read();
            for cr in queue.iter() {
                if !cr.acquire() {
                    // Another processor holds it.
                    continue;
                }

                if cr.update_state() == RoutineState::Ready {
                    PerfEventCache::instance().add_sched_event(
                        SchedPerf::NextRt,
                        cr.id(),
                        cr.processor_id(),
                        0,
                    );
                    return Some(cr.clone());
                }

                if cr.state() == RoutineState::Sleep {
                    let wake = cr.wake_time_ns();
                    if !self.need_sleep.load(Ordering::Relaxed)
                        || self.wake_time_ns.load(Ordering::Relaxed) > wake
                    {
                        self.need_sleep.store(true, Ordering::Relaxed);
                        self.wake_time_ns.store(wake, Ordering::Relaxed);
                    }
                }

                cr.release();
            }
        }
        None
    }

    /// Park until notified, or until the earliest wake time recorded by
    /// the previous scan passes.
    pub fn wait(&self) {
        if self.stop.load(Ordering::Acquire) {
            return;
        }

        let need_sleep = self.need_sleep.swap(false, Ordering::Relaxed);
        let mut wait_queue = lock(&self.group.wait_queue);
        if !wait_queue.notified {
            if need_sleep {
                let timeout = Duration::from_nanos(
                    self.wake_time_ns
                        .load(Ordering::Relaxed)
                        .saturating_sub(monotonic_now_ns()),
                );
                let (guard, _) = self
                    .group
                    .wait_cv
                    .wait_timeout(wait_queue, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
                wait_queue = guard;
            } else {
                wait_queue = self
                    .group
                    .wait_cv
                    .wait(wait_queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        wait_queue.notified = false;
    }

    /// Stop this context and wake every processor parked on the group.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut wait_queue = lock(&self.group.wait_queue);
            wait_queue.notified = true;
        }
        self.group.wait_cv.notify_all();
    }

    /// Wake one processor of `group_name`.
    pub fn notify(group_name: &str) {
        let group = group_state(group_name);
        {
            let mut wait_queue = lock(&group.wait_queue);
            wait_queue.notified = true;
        }
        group.wait_cv.notify_one();
    }
}

fn lock(mutex: &Mutex<WaitQueue>) -> MutexGuard<'_, WaitQueue> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
