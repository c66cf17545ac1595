//! Channel wake-up fan-out.
//!
//! Publishers call [`DataNotifier::notify`] after new data lands on a
//! channel; every callback registered for that channel runs synchronously
//! on the publisher's thread, in registration order. Callbacks typically
//! capture a coroutine handle, set its update flag, and poke the
//! coroutine's scheduling group.

use std::collections::HashMap;
use std::sync::Arc;

use spin::Lazy;

use crate::base::AtomicRwLock;

/// A registered wake-up callback.
pub struct Notifier {
    pub callback: Box<dyn Fn() + Send + Sync>,
}

impl Notifier {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

type NotifyVector = Vec<Arc<Notifier>>;

/// Process-wide channel-id → callback-list map.
///
/// Registration is rare; notification is the hot path, so `notify` copies
/// the list under a reader lock and invokes outside it.
pub struct DataNotifier {
    notifies_map: AtomicRwLock<HashMap<u64, NotifyVector>>,
}

static INSTANCE: Lazy<DataNotifier> = Lazy::new(DataNotifier::new);

impl DataNotifier {
    fn new() -> Self {
        Self {
            notifies_map: AtomicRwLock::new(HashMap::new()),
        }
    }

    pub fn instance() -> &'static DataNotifier {
        &INSTANCE
    }

    /// Append `notifier` to the channel's callback list, creating the list
    /// on first registration.
    pub fn add_notifier(&self, channel_id: u64, notifier: Arc<Notifier>) {
        let mut map = self.notifies_map.write();
        map.entry(channel_id).or_default().push(notifier);
    }

    /// Invoke every callback registered for `channel_id`, in registration
    /// order, on the calling thread. Returns whether the channel had any
    /// registration.
    pub fn notify(&self, channel_id: u64) -> bool {
        let notifiers = {
            let map = self.notifies_map.read();
            match map.get(&channel_id) {
                Some(list) => list.clone(),
                None => return false,
            }
        };
        for notifier in &notifiers {
            (notifier.callback)();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn notify_runs_callbacks_in_registration_order() {
        // Channel ids are process-wide; keep this test on its own ids.
        let channel = crate::common::global_data::register_channel("notifier_order_test");
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 1..=3 {
            let o = order.clone();
            DataNotifier::instance()
                .add_notifier(channel, Arc::new(Notifier::new(move || {
                    o.lock().unwrap().push(tag);
                })));
        }

        assert!(DataNotifier::instance().notify(channel));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);

        // A second notify fans out again.
        assert!(DataNotifier::instance().notify(channel));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn notify_unknown_channel_is_false() {
        let channel = crate::common::global_data::register_channel("notifier_unknown_test");
        assert!(!DataNotifier::instance().notify(channel));
    }
}
