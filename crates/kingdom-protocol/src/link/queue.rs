//! Outbound priority queue: highest priority first, FIFO within a priority.
//!
//! Popping an entry marks it in flight under the same lock, so a queue is
//! idle only once the popped entry is finished or requeued.
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::message::Message;
use crate::types::Priority;

#[derive(Debug)]
pub(crate) struct Queued {
    priority: Priority,
    seq: u64,
    pub(crate) message: Message,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, then the older sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    in_flight: usize,
}

#[derive(Default)]
pub(crate) struct SendQueue {
    state: Mutex<State>,
    ready: Notify,
}

impl SendQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Enqueue messages back to back so nothing interleaves between them.
    pub(crate) fn push_all(&self, messages: impl IntoIterator<Item = Message>) {
        {
            let mut state = self.lock();
            for message in messages {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.heap.push(Queued {
                    priority: message.priority,
                    seq,
                    message,
                });
            }
        }
        self.ready.notify_one();
    }

    /// Put an in-flight message back with its original position.
    pub(crate) fn requeue(&self, entry: Queued) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.heap.push(entry);
        }
        self.ready.notify_one();
    }

    /// The popped entry was written or dropped.
    pub(crate) fn finish(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    pub(crate) fn try_pop(&self) -> Option<Queued> {
        let mut state = self.lock();
        let entry = state.heap.pop()?;
        state.in_flight += 1;
        Some(entry)
    }

    pub(crate) async fn pop(&self) -> Queued {
        loop {
            if let Some(entry) = self.try_pop() {
                return entry;
            }
            self.ready.notified().await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().heap.len()
    }

    /// Nothing queued and nothing in flight.
    pub(crate) fn is_idle(&self) -> bool {
        let state = self.lock();
        state.heap.is_empty() && state.in_flight == 0
    }
}
