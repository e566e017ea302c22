//! Reusable read buffers for outbound connections.
//!
//! Every dial needs a read buffer. Buffers from dials that failed for a
//! transient reason come back here and are handed to the next attempt.

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::config::PoolConfig;

/// Bounded pool of idle outbound read buffers.
pub struct ConnectionPool {
    idle: Mutex<Vec<BytesMut>>,
    capacity: usize,
    buffer_size: usize,
}

impl ConnectionPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(config.capacity)),
            capacity: config.capacity,
            buffer_size: config.buffer_size,
        }
    }

    /// Takes an idle buffer or allocates a fresh one.
    pub fn acquire(&self) -> BytesMut {
        self.idle
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size))
    }

    /// Returns a buffer for reuse. Dropped when the pool is full.
    pub fn release(&self, mut buffer: BytesMut) {
        buffer.clear();
        if buffer.capacity() < self.buffer_size {
            buffer.reserve(self.buffer_size);
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(buffer);
        }
    }

    /// Buffers currently waiting for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}
