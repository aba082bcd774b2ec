// Time-ordered action queue.
//
// Multi-producer, single-consumer. Actions carry a not-before time and an
// optional expiry; delivery is in not-before order (FIFO among equal
// times), never early, and never after the expiry has passed — expired
// actions are discarded and counted instead. Inserting an action earlier
// than the current wake time re-arms the consumer's wait.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::debug;

use crate::event::NoteEvent;

/// An action waiting in the queue.
#[derive(Debug)]
pub struct QueuedAction {
    pub payload: NoteEvent,
    pub not_before: Instant,
    pub expiry: Option<Instant>,
}

/// Outcome of a consumer wait.
#[derive(Debug)]
pub enum Wait {
    /// An action whose time has arrived.
    Ready(QueuedAction),
    /// The caller-supplied deadline passed first.
    Deadline,
    /// The queue was closed and nothing ready remains.
    Closed,
}

struct Entry {
    not_before: Instant,
    seq: u64,
    action: QueuedAction,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.not_before == other.not_before && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Inverted so the max-heap pops the earliest entry; equal times pop in
    // insertion order.
    fn cmp(&self, other: &Entry) -> Ordering {
        other
            .not_before
            .cmp(&self.not_before)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    available: Condvar,
    dropped: AtomicU64,
}

/// The shared queue handle. Cloning shares the queue.
#[derive(Clone)]
pub struct TimedQueue {
    inner: Arc<Inner>,
}

impl Default for TimedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimedQueue {
    pub fn new() -> TimedQueue {
        TimedQueue {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    heap: BinaryHeap::new(),
                    next_seq: 0,
                    closed: false,
                }),
                available: Condvar::new(),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Insert an action. Safe from any thread; ignored after close.
    pub fn push(&self, action: QueuedAction) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            not_before: action.not_before,
            seq,
            action,
        });
        self.inner.available.notify_one();
    }

    /// Close the queue and wake the consumer.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        self.inner.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Actions discarded because their expiry passed before delivery.
    pub fn dropped_expired(&self) -> u64 {
        self.inner.dropped.load(AtomicOrdering::Relaxed)
    }

    /// Wait for the next ready action, for `deadline` to pass, or for the
    /// queue to close — whichever comes first.
    pub fn pop_ready(&self, deadline: Option<Instant>) -> Wait {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            let now = Instant::now();

            while let Some(head) = state.heap.peek() {
                if head.not_before > now {
                    break;
                }
                let entry = state.heap.pop().unwrap();
                if let Some(expiry) = entry.action.expiry
                    && expiry < now
                {
                    self.inner.dropped.fetch_add(1, AtomicOrdering::Relaxed);
                    debug!(
                        note = entry.action.payload.note,
                        late_us = (now - expiry).as_micros() as u64,
                        "dropping expired action"
                    );
                    continue;
                }
                return Wait::Ready(entry.action);
            }

            if state.closed {
                return Wait::Closed;
            }
            if let Some(limit) = deadline
                && now >= limit
            {
                return Wait::Deadline;
            }

            let mut target = state.heap.peek().map(|entry| entry.not_before);
            if let Some(limit) = deadline {
                target = Some(target.map_or(limit, |t| t.min(limit)));
            }
            state = match target {
                Some(at) => {
                    let wait = at.saturating_duration_since(now);
                    self.inner
                        .available
                        .wait_timeout(state, wait)
                        .unwrap()
                        .0
                }
                None => self.inner.available.wait(state).unwrap(),
            };
        }
    }
}
