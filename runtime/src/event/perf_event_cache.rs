//! Buffered sink for perf trace records.
//!
//! Hot paths (dispatch, pick-next) hand records to a bounded queue; a
//! flusher thread writes them as tab-separated lines into a
//! `cyber_perf_<stamp>.data` file. When the queue is full the record is
//! dropped rather than ever blocking a scheduling path.
//!
//! Recording is off unless the `cyber_sched_perf` / `cyber_trans_perf`
//! environment variables are set to a positive number when the cache is
//! first touched.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;

use spin::Lazy;

use super::perf_event::{stamp_now, SchedEvent, SchedPerf, TransPerf, TransportEvent};

/// Records queued but not yet written before producers start dropping.
const QUEUE_DEPTH: usize = 8192;

/// Environment variable enabling scheduling records.
const SCHED_PERF_ENV: &str = "cyber_sched_perf";

/// Environment variable enabling transport records.
const TRANS_PERF_ENV: &str = "cyber_trans_perf";

static INSTANCE: Lazy<PerfEventCache> = Lazy::new(PerfEventCache::from_env);

/// The buffered trace sink.
pub struct PerfEventCache {
    sched_enabled: bool,
    trans_enabled: bool,
    sender: Mutex<Option<SyncSender<String>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl PerfEventCache {
    /// The process-wide cache, configured from the environment on first
    /// use.
    pub fn instance() -> &'static PerfEventCache {
        &INSTANCE
    }

    fn from_env() -> Self {
        let sched_enabled = env_flag(SCHED_PERF_ENV);
        let trans_enabled = env_flag(TRANS_PERF_ENV);
        Self::with_options(sched_enabled, trans_enabled, Path::new("."))
    }

    /// A cache with explicit switches, writing under `dir`. Records go
    /// nowhere unless at least one switch is on. Exposed for tests and
    /// offline tools; production code uses [`PerfEventCache::instance`].
    pub fn with_options(sched_enabled: bool, trans_enabled: bool, dir: &Path) -> Self {
        let mut cache = Self {
            sched_enabled,
            trans_enabled,
            sender: Mutex::new(None),
            flusher: Mutex::new(None),
        };
        if sched_enabled || trans_enabled {
            cache.start(dir);
        }
        cache
    }

    fn start(&mut self, dir: &Path) {
        let path: PathBuf = dir.join(format!("cyber_perf_{}.data", stamp_now()));
        let file = match File::create(&path) {
            Ok(file) => file,
            Err(err) => {
                log::error!("cannot create perf file {}: {}", path.display(), err);
                return;
            }
        };

        let (sender, receiver) = sync_channel::<String>(QUEUE_DEPTH);
        let flusher = std::thread::Builder::new()
            .name(String::from("perf_flusher"))
            .spawn(move || {
                let mut writer = BufWriter::new(file);
                // Drains until every sender is dropped, then flushes.
                while let Ok(line) = receiver.recv() {
                    if writeln!(writer, "{}", line).is_err() {
                        break;
                    }
                }
                let _ = writer.flush();
            });

        match flusher {
            Ok(handle) => {
                *lock(&self.sender) = Some(sender);
                *lock(&self.flusher) = Some(handle);
                log::info!("perf recording to {}", path.display());
            }
            Err(err) => log::error!("cannot spawn perf flusher: {}", err),
        }
    }

    /// Queue a scheduling record. Cheap no-op while disabled; drops the
    /// record when the queue is full.
    pub fn add_sched_event(&self, eid: SchedPerf, cr_id: u64, proc_id: i32, extra: u64) {
        if !self.sched_enabled {
            return;
        }
        self.push(SchedEvent::new(eid, cr_id, proc_id, extra).serialize_to_string());
    }

    /// Queue a transport record. Cheap no-op while disabled.
    pub fn add_transport_event(&self, eid: TransPerf, channel_id: u64, msg_seq: u64) {
        if !self.trans_enabled {
            return;
        }
        self.push(TransportEvent::new(eid, channel_id, msg_seq).serialize_to_string());
    }

    fn push(&self, line: String) {
        let sender = lock(&self.sender);
        if let Some(sender) = sender.as_ref() {
            // Full or already shut down: drop the record.
            let _: Result<(), TrySendError<String>> = sender.try_send(line);
        }
    }

    /// Flush and stop the flusher thread. Idempotent; later records are
    /// silently discarded.
    pub fn shutdown(&self) {
        // Dropping the sender closes the queue; the flusher drains what is
        // left and exits.
        lock(&self.sender).take();
        if let Some(handle) = lock(&self.flusher).take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PerfEventCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .map(|value| value > 0)
        .unwrap_or(false)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
