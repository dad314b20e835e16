use std::collections::VecDeque;

use crate::event::Event;

/// A bounded FIFO queue backing one output (§4.6). Enqueue never blocks;
/// events that would push the queue past `max_size` are dropped and
/// counted rather than displacing anything already queued (§8,
/// invariant 3).
pub struct OutputQueue {
    events: VecDeque<Event>,
    max_size: usize,
    dropped: u64,
}

impl OutputQueue {
    pub fn new(max_size: usize) -> Self {
        OutputQueue { events: VecDeque::new(), max_size, dropped: 0 }
    }

    /// Enqueues a batch, preserving order; events past `max_size` are
    /// dropped and do not evict existing entries.
    pub fn enqueue(&mut self, events: Vec<Event>) -> usize {
        let room = self.max_size.saturating_sub(self.events.len());
        let accept = room.min(events.len());
        let dropped = events.len() - accept;

        for ev in events.into_iter().take(accept) {
            self.events.push_back(ev);
        }
        self.dropped += dropped as u64;
        dropped
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Puts a batch a failed send popped back at the front of the
    /// queue, preserving its original relative order and ahead of
    /// anything enqueued in the meantime (§4.6: transport transients
    /// leave events queued, subject to `max_size`). Events beyond the
    /// available room are dropped from the tail of `events` (the
    /// newest of the failed batch) rather than evicting anything
    /// already queued.
    pub fn requeue_front(&mut self, events: Vec<Event>) -> usize {
        let room = self.max_size.saturating_sub(self.events.len());
        let accept = room.min(events.len());
        let dropped = events.len() - accept;

        for ev in events.into_iter().take(accept).rev() {
            self.events.push_front(ev);
        }
        self.dropped += dropped as u64;
        dropped
    }

    /// Pops up to `max` events in FIFO order; `None` pops the whole queue.
    pub fn pop_batch(&mut self, max: Option<usize>) -> Vec<Event> {
        let take = max.unwrap_or(self.events.len()).min(self.events.len());
        self.events.drain(..take).collect()
    }

    /// Removes queued events whose `time + ttl < now`, returning how many
    /// were expired (§4.6 step 1, only used while the transport is not
    /// ready).
    pub fn expire(&mut self, now: f64) -> usize {
        let before = self.events.len();
        self.events.retain(|ev| !ev.has_expired(now));
        before - self.events.len()
    }
}
