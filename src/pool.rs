//! Reusable buffer pools for the broadcast hot path.
//!
//! Envelope serialization happens once per subscriber per message, so the
//! scratch buffers it needs are recycled instead of reallocated. The replay
//! ring backing storage is recycled the same way when clients disconnect.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::replay::ReplayEntry;

/// Upper bound on pooled buffers; beyond this, returned buffers are dropped.
const MAX_POOLED: usize = 1024;
/// Buffers that grew past this are not worth keeping around.
const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// Pool of serialization scratch buffers.
#[derive(Default)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Vec<u8> {
        self.buffers.lock().pop().unwrap_or_default()
    }

    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < MAX_POOLED {
            buffers.push(buf);
        }
    }

    /// Serialize with a pooled scratch buffer and freeze the result.
    pub fn serialize_json<T: serde::Serialize>(
        &self,
        value: &T,
    ) -> Result<Bytes, serde_json::Error> {
        let mut buf = self.get();
        let result = serde_json::to_writer(&mut buf, value);
        match result {
            Ok(()) => {
                let frame = Bytes::copy_from_slice(&buf);
                self.put(buf);
                Ok(frame)
            }
            Err(e) => {
                self.put(buf);
                Err(e)
            }
        }
    }

    pub fn pooled(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// Pool of replay-ring backing stores, recycled across client lifetimes.
#[derive(Default)]
pub struct RingPool {
    rings: Mutex<Vec<VecDeque<ReplayEntry>>>,
}

impl RingPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, capacity: usize) -> VecDeque<ReplayEntry> {
        match self.rings.lock().pop() {
            Some(ring) => ring,
            None => VecDeque::with_capacity(capacity),
        }
    }

    pub fn put(&self, mut ring: VecDeque<ReplayEntry>) {
        ring.clear();
        let mut rings = self.rings.lock();
        if rings.len() < MAX_POOLED {
            rings.push(ring);
        }
    }
}
