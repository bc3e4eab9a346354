//! Bounded outgoing buffer.
//!
//! Holds encoded frames written while the connection is not open. When the
//! queue is full the oldest frame is evicted, so the buffer always keeps the
//! most recent writes in their original order.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;

use tracing::debug;

// ============================================================================
// MessageBuffer
// ============================================================================

/// FIFO of encoded frames waiting for the connection to open.
#[derive(Debug, Default)]
pub(crate) struct MessageBuffer {
    frames: VecDeque<String>,
    capacity: Option<usize>,
}

impl MessageBuffer {
    /// Creates a buffer; `None` capacity is unbounded.
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity,
        }
    }

    /// Appends a frame, evicting the oldest one when full.
    ///
    /// Returns the evicted frame, if any.
    pub(crate) fn push(&mut self, frame: String) -> Option<String> {
        let evicted = match self.capacity {
            Some(capacity) if self.frames.len() >= capacity => self.frames.pop_front(),
            _ => None,
        };

        if evicted.is_some() {
            debug!(capacity = ?self.capacity, "Outgoing buffer full, evicted oldest frame");
        }

        self.frames.push_back(frame);
        evicted
    }

    /// Removes and returns every frame, oldest first.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = String> + '_ {
        self.frames.drain(..)
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn clear(&mut self) {
        self.frames.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
