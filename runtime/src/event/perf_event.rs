//! Perf trace records.
//!
//! Two record kinds share one tab-separated on-disk format, distinguished
//! by the leading event-type column: scheduling events (type 0) and
//! transport events (type 1). The rendering below is a compatibility
//! surface consumed by offline tooling; field order and the empty default
//! stamp are load-bearing.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Scheduling event ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SchedPerf {
    SwapIn = 1,
    SwapOut = 2,
    NotifyIn = 3,
    NextRt = 4,
    RtCreate = 5,
}

/// Transport event ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TransPerf {
    TransFrom = 1,
    TransTo = 2,
    WriteNotify = 3,
    ReadNotify = 4,
}

/// Wall-clock nanoseconds for event stamps.
pub(crate) fn stamp_now() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => since_epoch.as_nanos().to_string(),
        Err(_) => String::new(),
    }
}

/// A scheduling trace record.
///
/// Renders as `"0\t<eid>\t<stamp>\t<cr_id>\t<proc_id>\t<extra>"`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedEvent {
    pub eid: u32,
    pub stamp: String,
    pub cr_id: u64,
    pub proc_id: i32,
    pub extra: u64,
}

impl SchedEvent {
    pub fn new(eid: SchedPerf, cr_id: u64, proc_id: i32, extra: u64) -> Self {
        Self {
            eid: eid as u32,
            stamp: stamp_now(),
            cr_id,
            proc_id,
            extra,
        }
    }

    pub fn serialize_to_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SchedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0\t{}\t{}\t{}\t{}\t{}",
            self.eid, self.stamp, self.cr_id, self.proc_id, self.extra
        )
    }
}

/// A transport trace record.
///
/// Renders as `"1\t<eid>\t<stamp>\t<channel_id>\t<msg_seq>"`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub eid: u32,
    pub stamp: String,
    pub channel_id: u64,
    pub msg_seq: u64,
}

impl TransportEvent {
    pub fn new(eid: TransPerf, channel_id: u64, msg_seq: u64) -> Self {
        Self {
            eid: eid as u32,
            stamp: stamp_now(),
            channel_id,
            msg_seq,
        }
    }

    pub fn serialize_to_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "1\t{}\t{}\t{}\t{}",
            self.eid, self.stamp, self.channel_id, self.msg_seq
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sched_event_rendering() {
        let event = SchedEvent::default();
        assert_eq!(event.serialize_to_string(), "0\t0\t\t0\t0\t0");
    }

    #[test]
    fn default_transport_event_rendering() {
        let event = TransportEvent::default();
        assert_eq!(event.serialize_to_string(), "1\t0\t\t0\t0");
    }

    #[test]
    fn populated_events_keep_field_order() {
        let mut event = SchedEvent::new(SchedPerf::NextRt, 77, 3, 1);
        event.stamp = String::from("123");
        assert_eq!(event.serialize_to_string(), "0\t4\t123\t77\t3\t1");

        let mut event = TransportEvent::new(TransPerf::WriteNotify, 42, 9);
        event.stamp = String::from("456");
        assert_eq!(event.serialize_to_string(), "1\t3\t456\t42\t9");
    }
}
