//! Bounded message cache between the dispatcher and a reader coroutine.
//!
//! `CacheBuffer` is a ring over monotonically increasing head/tail
//! positions: once full, a fill overwrites the oldest element. It carries
//! no lock of its own; the dispatcher and reader share it through the
//! `spin::Mutex` a [`ChannelBuffer`] wraps around it.

use std::sync::Arc;

use spin::Mutex;

/// Fixed-capacity overwrite ring.
pub struct CacheBuffer<T> {
    slots: Vec<Option<T>>,
    /// Position just before the oldest retained element; head == tail
    /// means empty. Positions only ever grow.
    head: u64,
    /// Position of the newest element.
    tail: u64,
    capacity: u64,
}

impl<T> CacheBuffer<T> {
    /// A buffer that retains at most `size` elements.
    pub fn new(size: usize) -> Self {
        let capacity = size as u64 + 1;
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.resize_with(capacity as usize, || None);
        Self {
            slots,
            head: 0,
            tail: 0,
            capacity,
        }
    }

    /// Append `value`; overwrites the oldest element when full.
    pub fn fill(&mut self, value: T) {
        if self.is_full() {
            let index = self.index(self.head);
            self.slots[index] = Some(value);
            self.head += 1;
            self.tail += 1;
        } else {
            let index = self.index(self.tail + 1);
            self.slots[index] = Some(value);
            self.tail += 1;
        }
    }

    /// Element at absolute position `pos`, if still retained.
    pub fn at(&self, pos: u64) -> Option<&T> {
        if pos <= self.head || pos > self.tail {
            return None;
        }
        self.slots[self.index(pos)].as_ref()
    }

    /// The newest element.
    pub fn latest(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            self.slots[self.index(self.tail)].as_ref()
        }
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    pub fn size(&self) -> u64 {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.size() == self.capacity - 1
    }

    #[inline]
    fn index(&self, pos: u64) -> usize {
        (pos % self.capacity) as usize
    }
}

/// Shared handle type the dispatcher holds weakly and readers hold
/// strongly.
pub type SharedBuffer<T> = Arc<Mutex<CacheBuffer<Arc<T>>>>;

/// A channel id paired with its message cache.
///
/// Readers keep the strong reference; the dispatcher downgrades it, so a
/// reader going away drops the buffer without any coordination.
pub struct ChannelBuffer<T> {
    channel_id: u64,
    buffer: SharedBuffer<T>,
}

impl<T> ChannelBuffer<T> {
    pub fn new(channel_id: u64, size: usize) -> Self {
        Self {
            channel_id,
            buffer: Arc::new(Mutex::new(CacheBuffer::new(size))),
        }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn buffer(&self) -> &SharedBuffer<T> {
        &self.buffer
    }
}

impl<T> Clone for ChannelBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            channel_id: self.channel_id,
            buffer: self.buffer.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_and_read_back() {
        let mut buf: CacheBuffer<u32> = CacheBuffer::new(3);
        assert!(buf.is_empty());
        assert_eq!(buf.latest(), None);

        buf.fill(10);
        buf.fill(11);
        assert_eq!(buf.size(), 2);
        assert_eq!(buf.at(1), Some(&10));
        assert_eq!(buf.at(2), Some(&11));
        assert_eq!(buf.latest(), Some(&11));
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let mut buf: CacheBuffer<u32> = CacheBuffer::new(2);
        buf.fill(1);
        buf.fill(2);
        assert!(buf.is_full());

        buf.fill(3);
        // Position 1 (value 1) fell off; 2 and 3 remain.
        assert_eq!(buf.size(), 2);
        assert_eq!(buf.at(1), None);
        assert_eq!(buf.at(2), Some(&2));
        assert_eq!(buf.at(3), Some(&3));
        assert_eq!(buf.latest(), Some(&3));
    }

    #[test]
    fn positions_outside_window_are_none() {
        let mut buf: CacheBuffer<u32> = CacheBuffer::new(4);
        buf.fill(1);
        assert_eq!(buf.at(0), None);
        assert_eq!(buf.at(2), None);
    }
}
