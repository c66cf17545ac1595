//! Perf tracing: scheduling and transport records plus their file sink.

pub mod perf_event;
pub mod perf_event_cache;

pub use perf_event::{SchedEvent, SchedPerf, TransPerf, TransportEvent};
pub use perf_event_cache::PerfEventCache;
