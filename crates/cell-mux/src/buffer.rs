//! Per-channel response buffer
//!
//! Hands received payloads from the receiver task to whichever client task
//! is currently waiting on the channel. There is a single waiter slot: a
//! task takes it with [`ResponseBuffer::acquire`] and holds it for the
//! duration of one exchange. While the slot is held the receiver pushes
//! into the queue; otherwise it takes the unsolicited-data path.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};

use cell_protocol::Frame;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::time::Instant;

/// Default number of items a buffer holds before reporting it is full
pub const DEFAULT_CAPACITY: usize = 5;

/// Something that carries response text
pub trait ResponseChunk {
    /// The text carried by this chunk
    fn text(&self) -> Cow<'_, str>;
}

impl ResponseChunk for Frame {
    fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl ResponseChunk for Vec<u8> {
    fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self)
    }
}

/// Bounded single-consumer queue with a waiter slot
#[derive(Debug)]
pub struct ResponseBuffer<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    awaiting: AtomicBool,
}

impl<T> ResponseBuffer<T> {
    /// Create a buffer holding up to `capacity` items
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            awaiting: AtomicBool::new(false),
        }
    }

    /// Whether a task currently holds the waiter slot
    pub fn is_awaiting(&self) -> bool {
        self.awaiting.load(Ordering::Acquire)
    }

    /// Queue an item for the waiter; hands it back when the buffer is full
    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(item) | mpsc::error::TrySendError::Closed(item) => item,
        })
    }

    /// Take the waiter slot
    ///
    /// Returns `None` when another task already holds it. Items left over
    /// from an earlier exchange are discarded.
    pub fn acquire(&self) -> Option<Waiter<'_, T>> {
        let mut rx = self.rx.try_lock().ok()?;
        while rx.try_recv().is_ok() {}
        self.awaiting.store(true, Ordering::Release);
        Some(Waiter { buffer: self, rx })
    }
}

impl<T> Default for ResponseBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Exclusive access to a [`ResponseBuffer`] for one exchange
///
/// Dropping the waiter releases the slot and resets the queue.
#[derive(Debug)]
pub struct Waiter<'a, T> {
    buffer: &'a ResponseBuffer<T>,
    rx: MutexGuard<'a, mpsc::Receiver<T>>,
}

impl<T> Waiter<'_, T> {
    /// Pop the next item, waiting no later than `deadline`
    ///
    /// A deadline already in the past returns `None` without looking at
    /// the queue.
    pub async fn pop_until(&mut self, deadline: Instant) -> Option<T> {
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::timeout_at(deadline, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Pop an item if one is queued
    pub fn try_pop(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        self.buffer.awaiting.store(false, Ordering::Release);
        while self.rx.try_recv().is_ok() {}
    }
}
