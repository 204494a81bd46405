//! FIFO waiter queue
//!
//! Acquirers that find the pool saturated enroll here. Each waiter owns the
//! receiving half of a one-shot channel; the pool keeps the sending half in
//! a FIFO queue. Dropping the receiver (timeout or caller cancellation)
//! marks the waiter dead in O(1); dead waiters are skipped and discarded at
//! dequeue, so the queue never stalls on them.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::conn::PooledConn;
use crate::error::{Error, Result};

/// The sending half of one enrolled acquirer.
pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) enrolled_at: Instant,
    tx: oneshot::Sender<Result<PooledConn>>,
}

impl Waiter {
    /// Hand a connection to this waiter.
    ///
    /// Returns the connection when the waiter died between the liveness
    /// check and the send (a racing cancellation), so the caller can offer
    /// it to the next waiter or re-park it.
    pub(crate) fn deliver(self, conn: PooledConn) -> std::result::Result<(), PooledConn> {
        match self.tx.send(Ok(conn)) {
            Ok(()) => Ok(()),
            Err(Ok(conn)) => Err(conn),
            Err(Err(_)) => Ok(()),
        }
    }

    /// Complete this waiter with an error. Best-effort: a dead waiter no
    /// longer cares.
    pub(crate) fn fail(self, err: Error) {
        let _ = self.tx.send(Err(err));
    }

    fn is_dead(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Strict-FIFO queue of pending acquirers.
pub(crate) struct WaitQueue {
    queue: VecDeque<Waiter>,
    next_id: u64,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Enroll a new waiter at the tail; returns its receiver.
    pub(crate) fn enroll(&mut self) -> (u64, oneshot::Receiver<Result<PooledConn>>) {
        let (tx, rx) = oneshot::channel();
        self.next_id += 1;
        let id = self.next_id;
        self.queue.push_back(Waiter {
            id,
            enrolled_at: Instant::now(),
            tx,
        });
        (id, rx)
    }

    /// Dequeue the oldest live waiter, discarding dead ones along the way.
    pub(crate) fn pop_live(&mut self) -> Option<Waiter> {
        while let Some(waiter) = self.queue.pop_front() {
            if !waiter.is_dead() {
                return Some(waiter);
            }
        }
        None
    }

    /// Take every remaining waiter (used when the pool closes).
    pub(crate) fn drain(&mut self) -> Vec<Waiter> {
        self.queue.drain(..).filter(|w| !w.is_dead()).collect()
    }

    /// Number of live waiters.
    pub(crate) fn live_len(&self) -> usize {
        self.queue.iter().filter(|w| !w.is_dead()).count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live_len() == 0
    }
}
