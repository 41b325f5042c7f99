//! Whole-frame port over a buffer pool.
//!
//! The unit of transfer for stages that need discrete-frame semantics,
//! e.g. variable-size encoded frames. "Writing" moves a filled node from
//! the producer to the pool's ready queue; "reading" removes a node for
//! consumption and later release.

use crate::error::{Error, Result};
use crate::pool::{BufferPool, FrameNode, PoolConfig};
use std::time::Duration;

/// A frame-oriented port. Thin clonable handle over a [`BufferPool`].
#[derive(Clone, Debug)]
pub struct FramePort {
    pool: BufferPool,
}

impl FramePort {
    /// Create a frame port with its own pool.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Ok(Self {
            pool: BufferPool::new(config)?,
        })
    }

    /// Wrap an existing pool (shared with other users).
    pub fn from_pool(pool: BufferPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for frame-level access.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Acquire an empty node for writing. See [`BufferPool::acquire_free`].
    pub fn acquire_for_write(&self, timeout: Option<Duration>) -> Result<FrameNode> {
        self.pool.acquire_free(timeout)
    }

    /// Commit a filled node to the ready queue, waking one waiting reader.
    pub fn commit(&self, node: FrameNode) {
        self.pool.commit(node);
    }

    /// Acquire the oldest ready node. `Ok(None)` signals completion.
    pub fn acquire_for_read(&self, timeout: Option<Duration>) -> Result<Option<FrameNode>> {
        self.pool.acquire_ready(timeout)
    }

    /// Return a consumed node to the free queue, waking one waiting writer.
    pub fn release(&self, node: FrameNode) {
        self.pool.release(node);
    }

    /// Byte-convenience write: one call moves one frame.
    pub fn write(&self, src: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let mut node = self.pool.acquire_free(timeout)?;
        if let Err(e) = node.fill(src) {
            self.pool.release(node);
            return Err(e);
        }
        self.pool.commit(node);
        Ok(src.len())
    }

    /// Byte-convenience read: one call consumes one whole frame.
    ///
    /// `dst` must be able to hold the frame; otherwise the frame is put
    /// back and [`Error::FrameTooLarge`] is returned. `Ok(0)` signals
    /// completion (pool done-writing and drained).
    pub fn read(&self, dst: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let node = match self.pool.acquire_ready(timeout)? {
            Some(node) => node,
            None => return Ok(0),
        };
        let n = node.len();
        if n > dst.len() {
            self.pool.requeue_ready_front(node);
            return Err(Error::FrameTooLarge {
                frame: n,
                capacity: dst.len(),
            });
        }
        dst[..n].copy_from_slice(node.payload());
        self.pool.release(node);
        Ok(n)
    }

    /// Mark the port done-writing.
    pub fn finish(&self) {
        self.pool.finish();
    }

    /// Abort all pending and future waits on the port.
    pub fn abort(&self) {
        self.pool.abort();
    }

    /// Rewind the port without destroying the pool.
    pub fn reset(&self) {
        self.pool.reset();
    }

    /// Free nodes available to the producer.
    pub fn free_space(&self) -> usize {
        self.pool.free_len()
    }

    /// Ready frames waiting for the consumer.
    pub fn fill_level(&self) -> usize {
        self.pool.ready_len()
    }
}
