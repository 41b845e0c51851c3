//! Fixed-capacity blocking ring buffer between the decode thread and the
//! consumer.
//!
//! One mutex and one condition variable. `push` parks while the ring is
//! full; `pop` parks until the requested count is available or the producer
//! has called [`BoundedBuffer::push_done`].

use parking_lot::{Condvar, Mutex};
use vidseek_core::{Result, VidSeekError};

struct Ring<T> {
    slots: Vec<Option<T>>,
    /// Next slot to write.
    head: usize,
    /// Next slot to read.
    tail: usize,
    count: usize,
    done: bool,
}

impl<T> Ring<T> {
    fn take(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let item = self.slots[self.tail].take();
        self.tail = (self.tail + 1) % self.slots.len();
        self.count -= 1;
        item
    }
}

/// A single-producer single-consumer bounded queue.
pub struct BoundedBuffer<T> {
    capacity: usize,
    ring: Mutex<Ring<T>>,
    cond: Condvar,
}

impl<T> BoundedBuffer<T> {
    /// Create a buffer holding at most `capacity` items.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(VidSeekError::InvalidParameter(
                "buffer capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            ring: Mutex::new(Ring {
                slots: std::iter::repeat_with(|| None).take(capacity).collect(),
                head: 0,
                tail: 0,
                count: 0,
                done: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_done(&self) -> bool {
        self.ring.lock().done
    }

    /// Append `item`, blocking while the buffer is full.
    pub fn push(&self, item: T) {
        let mut ring = self.ring.lock();
        while ring.count == self.capacity {
            self.cond.wait(&mut ring);
        }
        let head = ring.head;
        ring.slots[head] = Some(item);
        ring.head = (head + 1) % self.capacity;
        ring.count += 1;
        drop(ring);
        self.cond.notify_one();
    }

    /// Mark the stream finished. Waiting and future pops return short.
    pub fn push_done(&self) {
        self.ring.lock().done = true;
        self.cond.notify_all();
    }

    /// Take `count` items, blocking until that many exist or the stream is
    /// done. `count == 0` drains whatever is queued without blocking. An
    /// empty result after `push_done` signals end-of-stream.
    pub fn pop(&self, count: usize) -> Result<Vec<T>> {
        if count > self.capacity {
            return Err(VidSeekError::InvalidParameter(format!(
                "pop of {count} items exceeds buffer capacity {}",
                self.capacity
            )));
        }

        let mut ring = self.ring.lock();
        let wanted = if count == 0 {
            ring.count
        } else {
            while ring.count < count && !ring.done {
                self.cond.wait(&mut ring);
            }
            count.min(ring.count)
        };

        let mut items = Vec::with_capacity(wanted);
        for _ in 0..wanted {
            if let Some(item) = ring.take() {
                items.push(item);
            }
        }
        drop(ring);
        self.cond.notify_one();
        Ok(items)
    }

    /// Drop queued items and reset the done flag. Storage is kept.
    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.slots.iter_mut().for_each(|slot| *slot = None);
        ring.head = 0;
        ring.tail = 0;
        ring.count = 0;
        ring.done = false;
        drop(ring);
        self.cond.notify_all();
    }
}
