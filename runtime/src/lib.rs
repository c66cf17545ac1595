//! Torque RT runtime: a cooperative coroutine scheduler for real-time
//! robotics middleware.
//!
//! Many lightweight stackful coroutines are multiplexed over a fixed pool
//! of kernel threads pinned to CPUs, with per-group priority run queues,
//! event-driven wakeups, and a user-space context switch.
//!
//! The pieces, bottom up:
//!
//! - [`base`]: the atomic reader/writer lock and the fixed-size concurrent
//!   hash map everything else leans on.
//! - [`croutine`]: the coroutine object, its lifecycle state machine, and
//!   the context-switch primitive.
//! - [`data`]: message buffers, the dispatcher that fans messages into
//!   them, and the notifier that wakes waiting coroutines.
//! - [`scheduler`]: the classic policy (priority run queues per group,
//!   pinned worker threads) and its façade.
//! - [`event`] / [`logger`]: perf trace records and the asynchronous log
//!   backend.
//!
//! ```no_run
//! use std::sync::Arc;
//! use torque_runtime::croutine::{self, CRoutine};
//! use torque_runtime::scheduler::SchedulerClassic;
//! use torque_runtime::common::global_data;
//!
//! let scheduler = SchedulerClassic::instance();
//!
//! let cr = Arc::new(CRoutine::new(|| {
//!     // wait until someone publishes data for us
//!     croutine::hang_up();
//!     log::info!("woken up");
//! }));
//! cr.set_id(global_data::register_task_name("monitor"));
//! cr.set_name("monitor");
//!
//! scheduler.dispatch_task(cr.clone());
//! // ... later, from a data callback:
//! scheduler.notify_processor(cr.id());
//! ```

pub mod base;
pub mod common;
pub mod croutine;
pub mod data;
pub mod event;
pub mod logger;
pub mod scheduler;
pub mod state;

pub use croutine::{CRoutine, RoutineState};
pub use data::{ChannelBuffer, DataDispatcher, DataNotifier, Notifier};
pub use scheduler::{ClassicConf, GroupConf, SchedulerClassic, TaskConf};
