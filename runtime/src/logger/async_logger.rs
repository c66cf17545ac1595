// =============================================================================
// Torque RT — Asynchronous Logger
// =============================================================================
//
// A `log::Log` backend that never blocks the logging thread on file I/O.
// Records are formatted into an in-memory buffer; a flusher thread swaps
// the active buffer against a spare and writes the full one out. When the
// active buffer is over budget, new records are dropped: a worker under
// SCHED_FIFO must not stall behind a slow disk.
//
// FLUSH PROTOCOL:
//   `flush` marks the active buffer and waits until the flusher has
//   completed two swap cycles, which guarantees both buffers (the one
//   being written and the one accumulating) have hit the file.
// =============================================================================

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{Level, LevelFilter, Metadata, Record};

/// Total in-memory budget, split evenly between the two buffers.
const DEFAULT_MAX_BUFFER_BYTES: usize = 2 * 1024 * 1024;

/// The flusher writes out at least this often even without a flush mark.
const PERIODIC_FLUSH: Duration = Duration::from_secs(2);

/// One formatted record.
struct Msg {
    level: Level,
    text: String,
}

/// A swap buffer of pending records.
#[derive(Default)]
struct Buffer {
    messages: Vec<Msg>,
    bytes: usize,
    /// An explicit flush was requested while this buffer accumulated.
    flush_requested: bool,
}

impl Buffer {
    fn add(&mut self, msg: Msg, flush: bool) {
        self.bytes += msg.text.len();
        self.messages.push(msg);
        self.flush_requested |= flush;
    }

    fn needs_write(&self) -> bool {
        !self.messages.is_empty() || self.flush_requested
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.bytes = 0;
        self.flush_requested = false;
    }
}

#[derive(PartialEq)]
enum State {
    Running,
    Stopped,
}

struct Core {
    state: State,
    active: Buffer,
    flush_count: u64,
}

/// Asynchronous file logger. Install with [`crate::logger::init`].
pub struct AsyncLogger {
    core: Mutex<Core>,
    wake_flusher: Condvar,
    flush_complete: Condvar,
    max_buffer_bytes: usize,
    level: LevelFilter,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncLogger {
    /// Starts the flusher thread writing to `path`.
    pub fn start(path: &Path, level: LevelFilter) -> std::io::Result<Arc<AsyncLogger>> {
        let file = File::create(path)?;
        let logger = Arc::new(AsyncLogger {
            core: Mutex::new(Core {
                state: State::Running,
                active: Buffer::default(),
                flush_count: 0,
            }),
            wake_flusher: Condvar::new(),
            flush_complete: Condvar::new(),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            level,
            flusher: Mutex::new(None),
        });

        let worker = logger.clone();
        let handle = std::thread::Builder::new()
            .name(String::from("async_logger"))
            .spawn(move || worker.run_flusher(file))?;
        *lock(&logger.flusher) = Some(handle);
        Ok(logger)
    }

    /// Queue one formatted record. Drops it when the active buffer is over
    /// budget or the logger has stopped.
    fn write(&self, level: Level, text: String, force_flush: bool) {
        {
            let mut core = lock(&self.core);
            if core.state != State::Running {
                return;
            }
            if core.active.bytes > self.max_buffer_bytes / 2 {
                return;
            }
            core.active.add(Msg { level, text }, force_flush);
        }
        self.wake_flusher.notify_one();
    }

    /// Block until everything logged so far is in the file.
    pub fn flush_blocking(&self) {
        let mut core = lock(&self.core);
        if core.state != State::Running {
            return;
        }
        let target = core.flush_count + 2;
        while core.flush_count < target && core.state == State::Running {
            core.active.flush_requested = true;
            self.wake_flusher.notify_one();
            core = self
                .flush_complete
                .wait(core)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop the flusher and drain remaining records. Idempotent.
    pub fn stop(&self) {
        {
            let mut core = lock(&self.core);
            if core.state == State::Stopped {
                return;
            }
            core.state = State::Stopped;
        }
        self.wake_flusher.notify_one();
        if let Some(handle) = lock(&self.flusher).take() {
            let _ = handle.join();
        }
    }

    fn run_flusher(&self, file: File) {
        let mut writer = BufWriter::new(file);
        let mut flushing = Buffer::default();

        let mut core = lock(&self.core);
        while core.state == State::Running || core.active.needs_write() {
            // Park until there is something to write or the periodic
            // deadline passes (then force a write-out of what we have).
            while !core.active.needs_write() && core.state == State::Running {
                let (guard, timeout) = self
                    .wake_flusher
                    .wait_timeout(core, PERIODIC_FLUSH)
                    .unwrap_or_else(PoisonError::into_inner);
                core = guard;
                if timeout.timed_out() {
                    core.active.flush_requested = true;
                }
            }

            std::mem::swap(&mut core.active, &mut flushing);
            drop(core);

            for msg in &flushing.messages {
                let _ = writeln!(writer, "{}", msg.text);
                // Warnings and errors go out immediately.
                if msg.level <= Level::Warn {
                    let _ = writer.flush();
                }
            }
            if flushing.flush_requested {
                let _ = writer.flush();
            }
            flushing.clear();

            core = lock(&self.core);
            core.flush_count += 1;
            self.flush_complete.notify_all();
        }
        let _ = writer.flush();
    }
}

impl log::Log for AsyncLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = record.level();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or(0);
        let text = format!(
            "{} {} [{}] {}",
            level_tag(level),
            stamp,
            record.target(),
            record.args()
        );
        self.write(level, text, level <= Level::Warn);
    }

    fn flush(&self) {
        self.flush_blocking();
    }
}

fn level_tag(level: Level) -> char {
    match level {
        Level::Error => 'E',
        Level::Warn => 'W',
        Level::Info => 'I',
        Level::Debug => 'D',
        Level::Trace => 'T',
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
