use std::sync::Arc;

use crate::UnitId;
use crate::eventlog::{EventSink, QueueEvent};
use crate::ringbuffer::{QueueError, Resize, RingBuffer};

// The narrow capability the coordinator needs from a queue. Callers provide
// their own locking.
pub trait WorkQueue: Send {
    fn enqueue(&mut self, item: UnitId) -> Result<(), QueueError>;
    fn dequeue(&mut self) -> Result<UnitId, QueueError>;
    fn is_empty(&self) -> bool;
    fn len(&self) -> usize;
    fn capacity(&self) -> usize;
}

/// A `RingBuffer` that reports every insert, removal and resize to an `EventSink`.
pub struct LoggedQueue {
    buffer: RingBuffer<UnitId>,
    sink: Arc<dyn EventSink>,
}

impl LoggedQueue {
    pub fn new(capacity: usize, sink: Arc<dyn EventSink>) -> Result<Self, QueueError> {
        Ok(LoggedQueue {
            buffer: RingBuffer::with_capacity(capacity)?,
            sink,
        })
    }

    fn record_resize(&self, resize: Option<Resize>) {
        let Some(resize) = resize else { return };
        debug!("queue {resize}");
        let event = match resize {
            Resize::Grew { to, .. } => QueueEvent::Grew { capacity: to },
            Resize::Shrank { to, .. } => QueueEvent::Shrank { capacity: to },
        };
        self.sink.record(&event);
    }
}

impl WorkQueue for LoggedQueue {
    fn enqueue(&mut self, item: UnitId) -> Result<(), QueueError> {
        let resize = self.buffer.push(item)?;
        self.record_resize(resize);
        self.sink.record(&QueueEvent::Enqueued {
            item,
            len: self.buffer.len(),
            capacity: self.buffer.capacity(),
        });
        Ok(())
    }

    fn dequeue(&mut self) -> Result<UnitId, QueueError> {
        let (item, resize) = self.buffer.pop()?;
        self.record_resize(resize);
        self.sink.record(&QueueEvent::Dequeued {
            item,
            len: self.buffer.len(),
            capacity: self.buffer.capacity(),
        });
        Ok(item)
    }

    fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}
