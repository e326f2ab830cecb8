use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is empty")]
    EmptyQueue,
    #[error("unable to allocate queue storage for {capacity} slots")]
    ResourceExhaustion { capacity: usize },
    #[error("queue capacity must be at least 1")]
    ZeroCapacity,
}

/// A capacity change performed by the buffer as a side effect of push or pop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resize {
    Grew { from: usize, to: usize },
    Shrank { from: usize, to: usize },
}

impl fmt::Display for Resize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resize::Grew { from, to } => write!(f, "grew {from} -> {to}"),
            Resize::Shrank { from, to } => write!(f, "shrank {from} -> {to}"),
        }
    }
}

// A circular FIFO whose capacity doubles when a push finds it full and halves
// when a pop leaves it at most a quarter full.
//
// The logical element i lives at items[(head + i) % capacity] for i < count.
// Slots outside that range are None.
pub struct RingBuffer<T> {
    items: Vec<Option<T>>,
    head: usize,
    tail: usize,
    count: usize,
}

impl<T> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        Ok(RingBuffer {
            items: empty_slots(capacity)?,
            head: 0,
            tail: 0,
            count: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    /// Appends `item` at the tail, doubling the capacity first if the buffer is full.
    ///
    /// The only failure is an allocation failure while growing, in which case the
    /// buffer is untouched and `item` is dropped.
    pub fn push(&mut self, item: T) -> Result<Option<Resize>, QueueError> {
        let mut resize = None;
        if self.is_full() {
            let from = self.capacity();
            let to = from
                .checked_mul(2)
                .ok_or(QueueError::ResourceExhaustion { capacity: usize::MAX })?;
            self.rebuild(to)?;
            resize = Some(Resize::Grew { from, to });
        }

        debug_assert!(self.items[self.tail].is_none());
        self.items[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.capacity();
        self.count += 1;

        debug_assert!(self.count <= self.capacity());
        Ok(resize)
    }

    /// Removes the item at the head.
    ///
    /// Popping an empty buffer returns `EmptyQueue` and changes nothing. After a
    /// successful removal, if `0 < count <= capacity / 4` the capacity is halved
    /// (never below 1). Pop itself never fails on a non-empty buffer.
    pub fn pop(&mut self) -> Result<(T, Option<Resize>), QueueError> {
        if self.count == 0 {
            return Err(QueueError::EmptyQueue);
        }

        let item = self.items[self.head]
            .take()
            .ok_or(QueueError::EmptyQueue)?;
        self.head = (self.head + 1) % self.capacity();
        self.count -= 1;

        let mut resize = None;
        if self.count > 0 && self.count <= self.capacity() / 4 {
            let from = self.capacity();
            let to = from / 2;
            // A shrink that cannot allocate is skipped; the buffer stays oversized.
            if to >= 1 && self.rebuild(to).is_ok() {
                resize = Some(Resize::Shrank { from, to });
            }
        }
        Ok((item, resize))
    }

    /// Returns a reference to the oldest item without removing it.
    pub fn front(&self) -> Option<&T> {
        if self.count == 0 {
            return None;
        }
        self.items[self.head].as_ref()
    }

    /// Iterates the items in logical (FIFO) order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let capacity = self.capacity();
        (0..self.count).filter_map(move |i| self.items[(self.head + i) % capacity].as_ref())
    }

    // rebuild moves the logical contents into fresh storage of `new_capacity`
    // slots, starting at index 0.
    fn rebuild(&mut self, new_capacity: usize) -> Result<(), QueueError> {
        debug_assert!(new_capacity >= self.count);
        let mut fresh = empty_slots(new_capacity)?;
        let old_capacity = self.capacity();
        for (i, slot) in fresh.iter_mut().take(self.count).enumerate() {
            *slot = self.items[(self.head + i) % old_capacity].take();
        }
        self.items = fresh;
        self.head = 0;
        self.tail = self.count % new_capacity;
        Ok(())
    }
}

fn empty_slots<T>(capacity: usize) -> Result<Vec<Option<T>>, QueueError> {
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(capacity)
        .map_err(|_| QueueError::ResourceExhaustion { capacity })?;
    slots.resize_with(capacity, || None);
    Ok(slots)
}

impl<T: fmt::Debug> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("items", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}
