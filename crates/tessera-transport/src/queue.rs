//! # Bounded FIFO Queue
//!
//! Fixed-capacity hand-off between threads, backed by a bounded crossbeam
//! channel. Enqueue never blocks: a full queue hands the item back.
//! Dequeue either fails immediately or waits up to a timeout.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

pub struct FifoQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> FifoQueue<T> {
    /// Create a queue holding at most `capacity` items. A zero capacity is
    /// bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        FifoQueue { tx, rx, capacity }
    }

    /// Append `item`. Returns it back when the queue is full.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            // both ends live in self, so the channel never disconnects
            Err(TrySendError::Full(item)) | Err(TrySendError::Disconnected(item)) => Err(item),
        }
    }

    /// Pop the oldest item without waiting.
    pub fn dequeue(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Pop the oldest item, waiting up to `timeout` for one to arrive.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
