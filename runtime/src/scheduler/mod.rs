//! The classic scheduling policy: configuration, per-group contexts,
//! worker threads, and the façade that ties them together.

pub mod classic;
pub mod classic_context;
pub mod conf;
pub mod processor;

pub use classic::SchedulerClassic;
pub use classic_context::{ClassicContext, MAX_PRIO};
pub use conf::{ClassicConf, GroupConf, TaskConf, DEFAULT_GROUP_NAME};
pub use processor::Processor;
