//! Size-bounded segment buffer
//!
//! Holds the events of the segment currently being recorded. When the
//! estimated size goes over the limit, everything is dropped and nothing is
//! accepted again until a checkout arrives, so every flushed segment can be
//! replayed on its own.

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ReplayResult;
use crate::event::CapturedEvent;

/// Result of [`EventBuffer::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// The event pushed the buffer over its limit; buffer and event were dropped
    Overflowed,
    /// Non-checkout event dropped while waiting for a checkout after an overflow
    AwaitingCheckout,
}

/// Position of a payload taken from the buffer, used to release exactly the
/// events that were sent once the transport confirms delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMark {
    generation: u64,
    len: usize,
}

impl BufferMark {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Read-only snapshot of the buffer counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferState {
    pub len: usize,
    pub size_bytes: usize,
    pub has_events: bool,
    pub has_checkout: bool,
    pub awaiting_checkout: bool,
}

#[derive(Debug, Clone)]
struct BufferedEvent {
    event: CapturedEvent,
    is_checkout: bool,
    size: usize,
}

#[derive(Debug)]
pub struct EventBuffer {
    entries: Vec<BufferedEvent>,
    has_checkout: bool,
    size_bytes: usize,
    max_size_bytes: usize,
    awaiting_checkout: bool,
    // bumped by every clear so stale marks cannot release newer events
    generation: u64,
}

impl EventBuffer {
    pub fn new(max_size_bytes: usize) -> Self {
        Self {
            entries: Vec::new(),
            has_checkout: false,
            size_bytes: 0,
            max_size_bytes,
            awaiting_checkout: false,
            generation: 0,
        }
    }

    pub fn add(&mut self, event: CapturedEvent, is_checkout: bool) -> AddOutcome {
        if self.awaiting_checkout && !is_checkout {
            debug!(
                "Dropping {} event at {}: buffer is waiting for a checkout",
                event.event_type, event.timestamp
            );
            return AddOutcome::AwaitingCheckout;
        }

        let size = event.estimated_size();
        self.entries.push(BufferedEvent {
            event,
            is_checkout,
            size,
        });
        self.size_bytes += size;
        if is_checkout {
            self.has_checkout = true;
            self.awaiting_checkout = false;
        }

        if self.size_bytes > self.max_size_bytes {
            warn!(
                "Replay buffer exceeded {} bytes ({} bytes across {} events), dropping segment until next checkout",
                self.max_size_bytes,
                self.size_bytes,
                self.entries.len()
            );
            self.clear();
            self.awaiting_checkout = true;
            return AddOutcome::Overflowed;
        }

        AddOutcome::Added
    }

    /// Serialize the buffered events, in append order, as the segment body
    pub fn get_payload(&self) -> ReplayResult<String> {
        let events: Vec<&CapturedEvent> = self.events().collect();
        Ok(serde_json::to_string(&events)?)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.has_checkout = false;
        self.size_bytes = 0;
        self.awaiting_checkout = false;
        self.generation += 1;
    }

    /// Mark covering every event currently buffered
    pub fn mark(&self) -> BufferMark {
        BufferMark {
            generation: self.generation,
            len: self.entries.len(),
        }
    }

    /// Drop the events covered by `mark`. Events appended after the mark was
    /// taken are kept. Returns how many events were released.
    pub fn release(&mut self, mark: BufferMark) -> usize {
        if mark.generation != self.generation {
            debug!("Buffer was cleared since the segment was taken, nothing to release");
            return 0;
        }
        let count = mark.len.min(self.entries.len());
        if count == self.entries.len() {
            self.clear();
            return count;
        }

        let released: usize = self.entries.drain(..count).map(|entry| entry.size).sum();
        self.size_bytes -= released;
        self.has_checkout = self.entries.iter().any(|entry| entry.is_checkout);
        count
    }

    pub fn has_events(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn has_checkout(&self) -> bool {
        self.has_checkout
    }

    pub fn is_awaiting_checkout(&self) -> bool {
        self.awaiting_checkout
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn events(&self) -> impl Iterator<Item = &CapturedEvent> {
        self.entries.iter().map(|entry| &entry.event)
    }

    pub fn state(&self) -> BufferState {
        BufferState {
            len: self.entries.len(),
            size_bytes: self.size_bytes,
            has_events: self.has_events(),
            has_checkout: self.has_checkout,
            awaiting_checkout: self.awaiting_checkout,
        }
    }
}
