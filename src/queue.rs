//! Bounded, closable intake queue between producers and the processor loop.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Result, StoreError};

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Multi-producer queue with a single draining consumer.
///
/// Producers `add` concurrently; exactly one consumer at a time may sit in
/// [`take`](Self::take). Items reach the consumer in the order their `add`
/// returned success.
pub struct IntakeQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Notify,
    capacity: Option<usize>,
}

impl<T> IntakeQueue<T> {
    /// New queue; `capacity: None` is unbounded.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Notify::new(),
            capacity,
        }
    }

    /// Enqueues `item`. On rejection the item is handed back alongside the
    /// error so the caller can fail it.
    pub fn add(&self, item: T) -> std::result::Result<(), (T, StoreError)> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err((item, StoreError::Closed("intake queue")));
            }
            if let Some(capacity) = self.capacity {
                if state.items.len() >= capacity {
                    return Err((item, StoreError::QueueFull));
                }
            }
            state.items.push_back(item);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Waits until at least one item is available, then returns up to `max`
    /// items in FIFO order. Fails with `Closed` once the queue is closed.
    pub async fn take(&self, max: usize) -> Result<VecDeque<T>> {
        loop {
            let notified = self.ready.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(StoreError::Closed("intake queue"));
                }
                if !state.items.is_empty() {
                    return Ok(drain_up_to(&mut state.items, max));
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`take`](Self::take): returns 0..max items
    /// immediately, an empty batch if the queue is empty or closed.
    pub fn poll(&self, max: usize) -> VecDeque<T> {
        let mut state = self.state.lock();
        if state.closed {
            return VecDeque::new();
        }
        drain_up_to(&mut state.items, max)
    }

    /// Closes the queue and returns everything still enqueued so the caller
    /// can fail it. Idempotent; subsequent `add` calls fail with `Closed`.
    pub fn close(&self) -> Vec<T> {
        let remainder = {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.drain(..).collect()
        };
        // notify_one stores a permit, so a consumer that has not yet
        // registered its wait still observes the close.
        self.ready.notify_one();
        remainder
    }

    /// Number of items waiting.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn drain_up_to<T>(items: &mut VecDeque<T>, max: usize) -> VecDeque<T> {
    let take = items.len().min(max.max(1));
    items.drain(..take).collect()
}
