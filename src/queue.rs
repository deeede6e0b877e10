//! Bounded packet FIFO with awaiting and non-blocking push/pop.
//!
//! The mutex-plus-two-condvars design of the session pipeline, expressed
//! with `tokio::sync::Notify` so waiters suspend the task instead of the
//! thread. `clear` wakes every waiter: a waiting `pop` resolves to
//! `None`, a waiting `push` hands the packet back to the caller.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::types::DEFAULT_QUEUE_CAPACITY;
use crate::wire::Packet;

struct Inner {
    items: VecDeque<Packet>,
    capacity: usize,
    /// Bumped on every `clear`. A waiter that observes a different epoch
    /// than the one it started waiting under was drained out.
    epoch: u64,
}

pub struct PacketQueue {
    inner: Mutex<Inner>,
    not_empty: Notify,
    not_full: Notify,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                epoch: 0,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Enqueue without suspending. On a full queue the packet is handed
    /// back so the caller keeps ownership.
    pub fn try_push(&self, packet: Packet) -> Result<(), Packet> {
        let mut q = self.inner.lock().unwrap();
        if q.items.len() >= q.capacity {
            return Err(packet);
        }
        q.items.push_back(packet);
        drop(q);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue without suspending.
    pub fn try_pop(&self) -> Option<Packet> {
        let mut q = self.inner.lock().unwrap();
        let packet = q.items.pop_front()?;
        drop(q);
        self.not_full.notify_one();
        Some(packet)
    }

    /// Enqueue, suspending while the queue is full. Returns the packet
    /// to the caller if the queue is cleared while waiting.
    pub async fn push(&self, packet: Packet) -> Result<(), Packet> {
        let mut waited_epoch: Option<u64> = None;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            // Register before checking so a wakeup between the check and
            // the await is not lost.
            notified.as_mut().enable();
            {
                let mut q = self.inner.lock().unwrap();
                if let Some(epoch) = waited_epoch
                    && q.epoch != epoch
                {
                    return Err(packet);
                }
                if q.items.len() < q.capacity {
                    q.items.push_back(packet);
                    drop(q);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                waited_epoch = Some(q.epoch);
            }
            notified.await;
        }
    }

    /// Dequeue, suspending while the queue is empty. Returns `None` if
    /// the queue is cleared while waiting.
    pub async fn pop(&self) -> Option<Packet> {
        let mut waited_epoch: Option<u64> = None;
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut q = self.inner.lock().unwrap();
                if let Some(epoch) = waited_epoch
                    && q.epoch != epoch
                {
                    return None;
                }
                if let Some(packet) = q.items.pop_front() {
                    drop(q);
                    self.not_full.notify_one();
                    return Some(packet);
                }
                waited_epoch = Some(q.epoch);
            }
            notified.await;
        }
    }

    /// Drop all queued packets and wake every waiter.
    pub fn clear(&self) {
        {
            let mut q = self.inner.lock().unwrap();
            q.items.clear();
            q.epoch += 1;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}
