use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Ordering hint for work waiting on a saturated gate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

// ---------------------------------------------------------------------------
// Waiter: max-heap entry, higher priority first, FIFO within a priority
// ---------------------------------------------------------------------------

struct Waiter {
    priority: Priority,
    seq: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct GateState {
    available: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
}

// ---------------------------------------------------------------------------
// PriorityGate
// ---------------------------------------------------------------------------

/// Counting gate with a fixed number of slots.
///
/// Unlike a plain semaphore, acquisitions that have to wait are granted in
/// priority order. Priority never preempts a slot that is already held.
pub struct PriorityGate {
    capacity: usize,
    state: Mutex<GateState>,
}

impl PriorityGate {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            capacity,
            state: Mutex::new(GateState {
                available: capacity,
                waiters: BinaryHeap::new(),
                next_seq: 0,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.lock().available
    }

    /// Acquisitions queued behind a saturated gate.
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Wait for a slot. Dropping the returned future before it resolves
    /// gives up the place in the queue without leaking a slot.
    pub async fn acquire(self: &Arc<Self>, priority: Priority) -> GatePermit {
        loop {
            let rx = {
                let mut state = self.lock();
                if state.available > 0 && state.waiters.is_empty() {
                    state.available -= 1;
                    return GatePermit {
                        gate: Arc::clone(self),
                    };
                }
                let (tx, rx) = oneshot::channel();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.waiters.push(Waiter { priority, seq, tx });
                rx
            };

            let mut pending = PendingAcquire {
                gate: Arc::clone(self),
                rx,
                granted: false,
            };
            if (&mut pending.rx).await.is_ok() {
                pending.granted = true;
                return GatePermit {
                    gate: Arc::clone(self),
                };
            }
            // Sender vanished without a grant; queue again.
            pending.granted = true;
        }
    }

    /// Hand the slot to the best live waiter, or return it to the pool.
    fn release(&self) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop() {
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }
        state.available = (state.available + 1).min(self.capacity);
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PriorityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PriorityGate")
            .field("capacity", &self.capacity)
            .field("available", &state.available)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

/// A held slot; released on drop.
pub struct GatePermit {
    gate: Arc<PriorityGate>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl std::fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePermit").finish_non_exhaustive()
    }
}

struct PendingAcquire {
    gate: Arc<PriorityGate>,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        // Cancelled while queued. A grant that raced with the cancellation
        // must be passed on.
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.gate.release();
        }
    }
}
