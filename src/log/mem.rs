//! In-memory durable log with controllable acknowledgment behavior.
//!
//! This is the implementation tests and benchmarks run against: appends can
//! be held and acknowledged out of order, individual writes can be failed,
//! and `fence` simulates another writer taking ownership.

use std::collections::VecDeque;
use std::future::ready;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, StoreError};
use crate::log::{AppendFuture, DurableLog, LogAddress};

struct HeldAppend {
    address: LogAddress,
    done: oneshot::Sender<Result<LogAddress>>,
}

#[derive(Default)]
struct Inner {
    records: Vec<(LogAddress, Bytes)>,
    next_sequence: u64,
    next_offset: u64,
    fenced: bool,
    closed: bool,
    holding: bool,
    fail_next: VecDeque<StoreError>,
    held: VecDeque<HeldAppend>,
}

/// See the [module docs](self).
#[derive(Default)]
pub struct InMemoryLog {
    inner: Mutex<Inner>,
}

impl InMemoryLog {
    /// Empty log, acknowledging appends immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops acknowledging appends; they stay pending until released.
    pub fn hold(&self) {
        self.inner.lock().holding = true;
    }

    /// Number of appends held back.
    pub fn held_count(&self) -> usize {
        self.inner.lock().held.len()
    }

    /// Acknowledges the oldest held append. Returns false if none are held.
    pub fn release_next(&self) -> bool {
        self.release_nth(0)
    }

    /// Acknowledges the `n`-th oldest held append, allowing out-of-order
    /// acknowledgment. Returns false if there is no such append.
    pub fn release_nth(&self, n: usize) -> bool {
        let held = {
            let mut inner = self.inner.lock();
            if n >= inner.held.len() {
                return false;
            }
            inner.held.remove(n)
        };
        if let Some(held) = held {
            let _ = held.done.send(Ok(held.address));
            true
        } else {
            false
        }
    }

    /// Acknowledges every held append in address order and resumes immediate
    /// acknowledgment.
    pub fn release_all(&self) {
        let drained: Vec<HeldAppend> = {
            let mut inner = self.inner.lock();
            inner.holding = false;
            inner.held.drain(..).collect()
        };
        for held in drained {
            let _ = held.done.send(Ok(held.address));
        }
    }

    /// Queues an error for an upcoming append. Each queued error fails one
    /// append, in order, before any address is assigned.
    pub fn fail_next(&self, err: StoreError) {
        self.inner.lock().fail_next.push_back(err);
    }

    /// Simulates another writer taking over: every subsequent append fails
    /// with `NotPrimary`.
    pub fn fence(&self) {
        self.inner.lock().fenced = true;
    }

    /// Snapshot of everything appended, in address order. Held appends are
    /// included: the write landed, only its acknowledgment is pending.
    pub fn contents(&self) -> Vec<(LogAddress, Bytes)> {
        self.inner.lock().records.clone()
    }

    /// Number of appended records.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Whether nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableLog for InMemoryLog {
    fn append(&self, payload: Bytes) -> AppendFuture {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Box::pin(ready(Err(StoreError::Closed("durable log"))));
        }
        if inner.fenced {
            return Box::pin(ready(Err(StoreError::NotPrimary(
                "log fenced by another writer".into(),
            ))));
        }
        if let Some(err) = inner.fail_next.pop_front() {
            return Box::pin(ready(Err(err)));
        }
        inner.next_sequence += 1;
        let address = LogAddress {
            sequence: inner.next_sequence,
            offset: inner.next_offset,
        };
        inner.next_offset += payload.len() as u64;
        inner.records.push((address, payload));
        if inner.holding {
            let (tx, rx) = oneshot::channel();
            inner.held.push_back(HeldAppend { address, done: tx });
            Box::pin(async move {
                rx.await
                    .unwrap_or(Err(StoreError::Closed("durable log")))
            })
        } else {
            Box::pin(ready(Ok(address)))
        }
    }

    fn close(&self) -> Result<()> {
        let drained: Vec<HeldAppend> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.held.drain(..).collect()
        };
        for held in drained {
            let _ = held.done.send(Err(StoreError::Closed("durable log")));
        }
        Ok(())
    }
}
