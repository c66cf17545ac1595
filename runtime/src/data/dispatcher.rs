//! Message fan-in: one publisher, many reader buffers.
//!
//! A `DataDispatcher<T>` routes each published message into every live
//! buffer registered for the channel, then asks the [`DataNotifier`] to
//! wake whoever is waiting. Buffers are held weakly: a reader that goes
//! away drops its buffer and the dispatcher silently skips the dead
//! reference on the next publish.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use spin::{Lazy, Mutex};

use super::cache_buffer::{CacheBuffer, ChannelBuffer};
use super::notifier::DataNotifier;
use crate::base::AtomicRwLock;
use crate::state;

type BufferVector<T> = Vec<Weak<Mutex<CacheBuffer<Arc<T>>>>>;

/// Per-message-type dispatcher singleton.
pub struct DataDispatcher<T> {
    buffers_map: AtomicRwLock<HashMap<u64, BufferVector<T>>>,
}

/// One dispatcher per message type. Rust has no per-instantiation statics,
/// so instances live in a TypeId-keyed registry.
static DISPATCHERS: Lazy<Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl<T: Send + Sync + 'static> DataDispatcher<T> {
    fn new() -> Self {
        Self {
            buffers_map: AtomicRwLock::new(HashMap::new()),
        }
    }

    /// The process-wide dispatcher for message type `T`.
    pub fn instance() -> Arc<DataDispatcher<T>> {
        let mut registry = DISPATCHERS.lock();
        let entry = registry
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(DataDispatcher::<T>::new()) as Arc<dyn Any + Send + Sync>);
        match entry.clone().downcast::<DataDispatcher<T>>() {
            Ok(dispatcher) => dispatcher,
            Err(_) => unreachable!("dispatcher registry entry keyed by a foreign TypeId"),
        }
    }

    /// Register a reader's buffer for its channel.
    pub fn add_buffer(&self, channel_buffer: &ChannelBuffer<T>) {
        let buffer = Arc::downgrade(channel_buffer.buffer());
        let mut map = self.buffers_map.write();
        map.entry(channel_buffer.channel_id()).or_default().push(buffer);
    }

    /// Push `msg` into every live buffer on `channel_id`, then notify the
    /// channel's wake callbacks.
    ///
    /// Returns `false` while shutting down, for a channel with no buffers,
    /// or when the notifier has no registration for the channel.
    pub fn dispatch(&self, channel_id: u64, msg: &Arc<T>) -> bool {
        if state::is_shutdown() {
            return false;
        }

        let buffers = {
            let map = self.buffers_map.read();
            match map.get(&channel_id) {
                Some(list) => list.clone(),
                None => return false,
            }
        };

        for weak_buffer in &buffers {
            if let Some(buffer) = weak_buffer.upgrade() {
                buffer.lock().fill(msg.clone());
            }
        }

        DataNotifier::instance().notify(channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::global_data;
    use crate::data::notifier::Notifier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatch_fills_buffers_and_notifies() {
        let channel = global_data::register_channel("dispatcher_fill_test");
        let dispatcher = DataDispatcher::<String>::instance();

        let chan_buffer: ChannelBuffer<String> = ChannelBuffer::new(channel, 4);
        dispatcher.add_buffer(&chan_buffer);

        let wakes = Arc::new(AtomicUsize::new(0));
        let w = wakes.clone();
        DataNotifier::instance().add_notifier(
            channel,
            Arc::new(Notifier::new(move || {
                w.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let msg = Arc::new(String::from("ping"));
        assert!(dispatcher.dispatch(channel, &msg));
        assert_eq!(wakes.load(Ordering::SeqCst), 1);

        let buf = chan_buffer.buffer().lock();
        assert_eq!(buf.size(), 1);
        assert_eq!(buf.latest().map(|m| m.as_str()), Some("ping"));
    }

    #[test]
    fn unknown_channel_is_false() {
        let channel = global_data::register_channel("dispatcher_unknown_test");
        let dispatcher = DataDispatcher::<u32>::instance();
        assert!(!dispatcher.dispatch(channel, &Arc::new(5)));
    }

    #[test]
    fn dead_buffers_are_skipped() {
        let channel = global_data::register_channel("dispatcher_dead_buffer_test");
        let dispatcher = DataDispatcher::<u32>::instance();

        let gone: ChannelBuffer<u32> = ChannelBuffer::new(channel, 2);
        dispatcher.add_buffer(&gone);
        drop(gone);

        let alive: ChannelBuffer<u32> = ChannelBuffer::new(channel, 2);
        dispatcher.add_buffer(&alive);

        DataNotifier::instance().add_notifier(channel, Arc::new(Notifier::new(|| {})));

        // The dead weak reference must not fail the publish.
        assert!(dispatcher.dispatch(channel, &Arc::new(9)));
        assert_eq!(alive.buffer().lock().size(), 1);
    }

    #[test]
    fn per_type_instances_are_distinct() {
        let a = DataDispatcher::<u32>::instance();
        let b = DataDispatcher::<u32>::instance();
        assert!(Arc::ptr_eq(&a, &b));

        // Different message types get different dispatchers, so a u64
        // channel registration is invisible to the u32 instance.
        let channel = global_data::register_channel("dispatcher_per_type_test");
        let wide: ChannelBuffer<u64> = ChannelBuffer::new(channel, 2);
        DataDispatcher::<u64>::instance().add_buffer(&wide);
        assert!(!DataDispatcher::<u32>::instance().dispatch(channel, &Arc::new(1)));
    }
}
