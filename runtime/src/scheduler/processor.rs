// =============================================================================
// Torque RT — Processor (worker thread)
// =============================================================================
//
// A processor is one kernel thread bound to a scheduling context. Its loop
// is the whole story:
//
//   while running:
//     cr = ctx.next_routine()
//     if cr: cr.resume(); cr.release()
//     else:  ctx.wait()
//
// The thread may be pinned to CPUs and given an OS scheduling policy.
// Failures of those syscalls are logged and the processor keeps running
// with default settings; a robot that cannot pin threads should still
// drive.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use spin::Once;

use super::classic_context::ClassicContext;

/// A worker thread running one group's pick-next loop.
pub struct Processor {
    context: Once<Arc<ClassicContext>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    /// Kernel thread id, published by the worker; -1 until known.
    tid: Arc<AtomicI32>,
}

impl Processor {
    pub fn new() -> Self {
        Self {
            context: Once::new(),
            thread: Mutex::new(None),
            running: Arc::new(AtomicBool::new(true)),
            tid: Arc::new(AtomicI32::new(-1)),
        }
    }

    /// Bind `context` and launch the worker thread. Only the first call
    /// has any effect.
    pub fn bind_context(&self, context: Arc<ClassicContext>) {
        self.context.call_once(|| {
            let worker_ctx = context.clone();
            let running = self.running.clone();
            let tid = self.tid.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("processor_{}", context.group_name()))
                .spawn(move || Self::run(worker_ctx, running, tid));
            match spawned {
                Ok(handle) => *lock(&self.thread) = Some(handle),
                Err(err) => {
                    log::error!("cannot spawn processor thread: {}", err);
                    self.running.store(false, Ordering::Release);
                }
            }
            context
        });
    }

    fn run(context: Arc<ClassicContext>, running: Arc<AtomicBool>, tid: Arc<AtomicI32>) {
        tid.store(gettid(), Ordering::SeqCst);
        log::info!(
            "processor for group {:?} running, tid {}",
            context.group_name(),
            tid.load(Ordering::SeqCst)
        );

        while running.load(Ordering::Acquire) {
            match context.next_routine() {
                Some(cr) => {
                    cr.resume();
                    // Acquired by next_routine.
                    cr.release();
                }
                None => context.wait(),
            }
        }
    }

    /// Published kernel thread id of the worker, or -1.
    pub fn tid(&self) -> i32 {
        self.tid.load(Ordering::SeqCst)
    }

    /// Pin the worker per `affinity`:
    /// `"range"` = the whole cpuset, `"1to1"` = `cpus[rank]`. An empty
    /// cpuset is a no-op.
    pub fn set_sched_affinity(&self, cpus: &[usize], affinity: &str, rank: usize) {
        if cpus.is_empty() {
            return;
        }
        match affinity {
            "range" => self.apply_affinity(cpus),
            "1to1" => match cpus.get(rank) {
                Some(&cpu) => self.apply_affinity(&[cpu]),
                None => log::warn!("1to1 affinity rank {} outside cpuset of {}", rank, cpus.len()),
            },
            _ => {}
        }
    }

    /// Apply an OS scheduling policy to the worker.
    ///
    /// FIFO/RR set a real-time priority on the thread; OTHER waits for the
    /// worker to publish its TID, then applies `prio` as a nice value.
    pub fn set_sched_policy(&self, policy: &str, prio: i32) {
        match policy {
            "SCHED_FIFO" => self.apply_rt_policy(RtPolicy::Fifo, prio),
            "SCHED_RR" => self.apply_rt_policy(RtPolicy::RoundRobin, prio),
            "SCHED_OTHER" => {
                if lock(&self.thread).is_none() {
                    log::warn!("set_sched_policy before bind_context");
                    return;
                }
                // The worker publishes its TID right after start.
                while self.tid.load(Ordering::SeqCst) == -1 {
                    if !self.running.load(Ordering::Acquire) {
                        return;
                    }
                    std::hint::spin_loop();
                }
                set_nice(self.tid.load(Ordering::SeqCst), prio);
            }
            _ => {}
        }
    }

    /// Stop the worker: flag it down, shut the context (waking the park),
    /// and join.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(context) = self.context.get() {
            context.shutdown();
        }
        if let Some(handle) = lock(&self.thread).take() {
            let _ = handle.join();
        }
    }

    #[cfg(target_os = "linux")]
    fn apply_affinity(&self, cpus: &[usize]) {
        use std::os::unix::thread::JoinHandleExt;

        let guard = lock(&self.thread);
        let Some(handle) = guard.as_ref() else {
            log::warn!("set_sched_affinity before bind_context");
            return;
        };
        // SAFETY: plain syscalls on a live pthread handle.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for &cpu in cpus {
                libc::CPU_SET(cpu, &mut set);
            }
            let rc = libc::pthread_setaffinity_np(
                handle.as_pthread_t(),
                std::mem::size_of::<libc::cpu_set_t>(),
                &set,
            );
            if rc != 0 {
                log::warn!("pthread_setaffinity_np failed ({}), not pinning", rc);
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_affinity(&self, _cpus: &[usize]) {
        log::warn!("cpu affinity is not supported on this platform");
    }

    #[cfg(target_os = "linux")]
    fn apply_rt_policy(&self, policy: RtPolicy, prio: i32) {
        use std::os::unix::thread::JoinHandleExt;

        let guard = lock(&self.thread);
        let Some(handle) = guard.as_ref() else {
            log::warn!("set_sched_policy before bind_context");
            return;
        };
        let os_policy = match policy {
            RtPolicy::Fifo => libc::SCHED_FIFO,
            RtPolicy::RoundRobin => libc::SCHED_RR,
        };
        // SAFETY: plain syscall on a live pthread handle.
        unsafe {
            let mut param: libc::sched_param = std::mem::zeroed();
            param.sched_priority = prio;
            let rc = libc::pthread_setschedparam(handle.as_pthread_t(), os_policy, &param);
            if rc != 0 {
                log::warn!(
                    "pthread_setschedparam({:?}, {}) failed ({}), keeping default policy",
                    policy,
                    prio,
                    rc
                );
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_rt_policy(&self, policy: RtPolicy, _prio: i32) {
        log::warn!("{:?} scheduling is not supported on this platform", policy);
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy)]
enum RtPolicy {
    Fifo,
    RoundRobin,
}

#[cfg(target_os = "linux")]
fn gettid() -> i32 {
    // SAFETY: gettid has no failure modes.
    (unsafe { libc::syscall(libc::SYS_gettid) }) as i32
}

#[cfg(not(target_os = "linux"))]
fn gettid() -> i32 {
    0
}

#[cfg(target_os = "linux")]
fn set_nice(tid: i32, prio: i32) {
    // SAFETY: setpriority on our own thread id.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, prio) };
    if rc != 0 {
        log::warn!("setpriority({}, {}) failed, keeping default nice", tid, prio);
    }
}

#[cfg(not(target_os = "linux"))]
fn set_nice(_tid: i32, _prio: i32) {
    log::warn!("thread nice values are not supported on this platform");
}

fn lock(mutex: &Mutex<Option<JoinHandle<()>>>) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
