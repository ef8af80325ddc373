//! Per-client replay buffer.
//!
//! A bounded ring of the most recent envelopes a client was sent (or would
//! have been sent - entries are inserted before the enqueue attempt, so a
//! frame dropped on a full queue is still replayable). Addressable by
//! sequence number for gap recovery.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::error;

/// A serialized envelope retained for replay, keyed by its sequence.
#[derive(Debug, Clone)]
pub struct ReplayEntry {
    pub seq: u64,
    pub frame: Bytes,
}

/// Bounded, strictly sequence-ordered ring of recent envelopes.
#[derive(Debug)]
pub struct ReplayRing {
    entries: VecDeque<ReplayEntry>,
    capacity: usize,
}

impl ReplayRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Build around recycled backing storage from the ring pool.
    pub fn from_storage(entries: VecDeque<ReplayEntry>, capacity: usize) -> Self {
        let mut ring = Self {
            entries,
            capacity: capacity.max(1),
        };
        ring.entries.clear();
        ring
    }

    /// Append an entry, evicting the oldest when full. Sequences must be
    /// strictly increasing; a regression means the caller's sequence counter
    /// is broken and the entry is refused to keep the ring ordered.
    pub fn add(&mut self, entry: ReplayEntry) {
        if let Some(last) = self.entries.back() {
            if entry.seq <= last.seq {
                error!(
                    last = last.seq,
                    offered = entry.seq,
                    "replay ring sequence regression, dropping entry"
                );
                return;
            }
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Entries with sequence strictly greater than `seq`, in order.
    pub fn get_since(&self, seq: u64) -> Vec<ReplayEntry> {
        let start = self.entries.partition_point(|e| e.seq <= seq);
        self.entries.iter().skip(start).cloned().collect()
    }

    /// Entries with `from <= seq <= to`, in order. A reversed range is empty.
    /// Ranges partially outside the retained window return what is available.
    pub fn get_range(&self, from: u64, to: u64) -> Vec<ReplayEntry> {
        if from > to {
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|e| e.seq >= from && e.seq <= to)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn oldest_seq(&self) -> Option<u64> {
        self.entries.front().map(|e| e.seq)
    }

    pub fn newest_seq(&self) -> Option<u64> {
        self.entries.back().map(|e| e.seq)
    }

    /// Hand the backing storage back for pooling.
    pub fn into_storage(self) -> VecDeque<ReplayEntry> {
        self.entries
    }
}
