//! Fixed-population buffer pool with free/ready queues.
//!
//! The pool is the unit of transfer between stages that need whole-frame
//! semantics: a producer acquires an empty node, fills it and commits it to
//! the ready queue; a consumer acquires the oldest ready node and releases
//! it back to the free queue when done. The node population is fixed for
//! the pool's lifetime, so a node is always in exactly one of
//! {free, ready, checked out}.
//!
//! A pool can be marked done-writing (reads drain then report completion)
//! or aborted (all pending waits return immediately), which is the only
//! reliable way to unblock a thread stuck in a long-timeout acquire.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

static POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Pool sizing, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of nodes in the pool.
    pub node_count: usize,
    /// Byte capacity of each node.
    pub node_size: usize,
    /// Byte capacity of each node's side-channel info record.
    pub info_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            node_count: 4,
            node_size: 4096,
            info_size: 0,
        }
    }
}

/// One reusable frame slot: a fixed-capacity byte buffer, a length field
/// and a small side-channel info record for per-frame metadata.
#[derive(Debug)]
pub struct FrameNode {
    data: Box<[u8]>,
    len: usize,
    info: Box<[u8]>,
    info_len: usize,
    pool_id: u64,
}

impl FrameNode {
    fn new(node_size: usize, info_size: usize, pool_id: u64) -> Self {
        Self {
            data: vec![0u8; node_size].into_boxed_slice(),
            len: 0,
            info: vec![0u8; info_size].into_boxed_slice(),
            info_len: 0,
            pool_id,
        }
    }

    /// Byte capacity of the node.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Valid payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Full backing buffer, for the producer to fill.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Current payload length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no payload has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the payload length after filling the buffer.
    ///
    /// Fails if `len` exceeds the node capacity.
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.data.len() {
            return Err(Error::FrameTooLarge {
                frame: len,
                capacity: self.data.len(),
            });
        }
        self.len = len;
        Ok(())
    }

    /// Copy `data` into the node and set the payload length.
    pub fn fill(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.data.len() {
            return Err(Error::FrameTooLarge {
                frame: data.len(),
                capacity: self.data.len(),
            });
        }
        self.data[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }

    /// The per-frame info record.
    pub fn info(&self) -> &[u8] {
        &self.info[..self.info_len]
    }

    /// Store a per-frame info record.
    ///
    /// Fails if `record` exceeds the configured info capacity.
    pub fn set_info(&mut self, record: &[u8]) -> Result<()> {
        if record.len() > self.info.len() {
            return Err(Error::FrameTooLarge {
                frame: record.len(),
                capacity: self.info.len(),
            });
        }
        self.info[..record.len()].copy_from_slice(record);
        self.info_len = record.len();
        Ok(())
    }

    fn clear(&mut self) {
        self.len = 0;
        self.info_len = 0;
    }
}

struct PoolState {
    free: VecDeque<FrameNode>,
    ready: VecDeque<FrameNode>,
    checked_out: usize,
    done: bool,
    aborted: bool,
}

struct PoolInner {
    id: u64,
    config: PoolConfig,
    state: Mutex<PoolState>,
    free_available: Condvar,
    ready_available: Condvar,
}

/// A fixed set of reusable, fixed-size frame slots.
///
/// Cheap-clone handle; all clones share one pool. Queue manipulation is
/// guarded by a single pool lock so free/ready moves stay atomic with
/// respect to concurrent producer and consumer threads.
#[derive(Clone)]
pub struct BufferPool {
    inner: std::sync::Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool with `config.node_count` identical nodes.
    ///
    /// Construction-time exhaustion (zero nodes, zero node size) fails
    /// synchronously; it is never reported as a runtime event.
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.node_count == 0 {
            return Err(Error::InvalidConfig("pool needs at least one node".into()));
        }
        if config.node_size == 0 {
            return Err(Error::InvalidConfig("pool node size must be > 0".into()));
        }

        let id = POOL_ID.fetch_add(1, Ordering::Relaxed);
        let free = (0..config.node_count)
            .map(|_| FrameNode::new(config.node_size, config.info_size, id))
            .collect();

        Ok(Self {
            inner: std::sync::Arc::new(PoolInner {
                id,
                config,
                state: Mutex::new(PoolState {
                    free,
                    ready: VecDeque::with_capacity(config.node_count),
                    checked_out: 0,
                    done: false,
                    aborted: false,
                }),
                free_available: Condvar::new(),
                ready_available: Condvar::new(),
            }),
        })
    }

    /// Acquire an empty node for writing, blocking up to `timeout`
    /// (`None` blocks until a node frees up or the pool is aborted).
    pub fn acquire_free(&self, timeout: Option<Duration>) -> Result<FrameNode> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.aborted {
                return Err(Error::Aborted);
            }
            if let Some(node) = state.free.pop_front() {
                state.checked_out += 1;
                return Ok(node);
            }
            state = self.wait(&self.inner.free_available, state, deadline)?;
        }
    }

    /// Move a filled node to the ready queue and wake one waiting reader.
    pub fn commit(&self, node: FrameNode) {
        debug_assert_eq!(node.pool_id, self.inner.id, "node committed to foreign pool");
        let mut state = self.inner.state.lock().unwrap();
        state.checked_out -= 1;
        state.ready.push_back(node);
        self.inner.ready_available.notify_one();
    }

    /// Acquire the oldest ready node, blocking up to `timeout`.
    ///
    /// Returns `Ok(None)` once the pool is done-writing and the ready
    /// queue has drained — completion, not an error.
    pub fn acquire_ready(&self, timeout: Option<Duration>) -> Result<Option<FrameNode>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.aborted {
                return Err(Error::Aborted);
            }
            if let Some(node) = state.ready.pop_front() {
                state.checked_out += 1;
                return Ok(Some(node));
            }
            if state.done {
                return Ok(None);
            }
            state = self.wait(&self.inner.ready_available, state, deadline)?;
        }
    }

    /// Clear a consumed node, return it to the free queue and wake one
    /// waiting writer.
    pub fn release(&self, mut node: FrameNode) {
        debug_assert_eq!(node.pool_id, self.inner.id, "node released to foreign pool");
        node.clear();
        let mut state = self.inner.state.lock().unwrap();
        state.checked_out -= 1;
        state.free.push_back(node);
        self.inner.free_available.notify_one();
    }

    /// Put a ready node back at the head of the ready queue, undoing an
    /// `acquire_ready` the caller could not complete.
    pub(crate) fn requeue_ready_front(&self, node: FrameNode) {
        debug_assert_eq!(node.pool_id, self.inner.id, "node requeued to foreign pool");
        let mut state = self.inner.state.lock().unwrap();
        state.checked_out -= 1;
        state.ready.push_front(node);
        self.inner.ready_available.notify_one();
    }

    /// Mark the pool done-writing: reads drain the remaining ready nodes,
    /// then report completion instead of blocking forever.
    pub fn finish(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.done = true;
        self.inner.ready_available.notify_all();
    }

    /// Abort the pool: all pending and future waits return
    /// [`Error::Aborted`] immediately instead of data.
    pub fn abort(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.aborted = true;
        self.inner.free_available.notify_all();
        self.inner.ready_available.notify_all();
        trace!("pool aborted");
    }

    /// Drain the ready queue back to free and clear the abort/done flags.
    ///
    /// Used when a pipeline rewinds without destroying the pool. Nodes
    /// currently checked out stay checked out.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while let Some(mut node) = state.ready.pop_front() {
            node.clear();
            state.free.push_back(node);
        }
        state.done = false;
        state.aborted = false;
        self.inner.free_available.notify_all();
    }

    /// Total node count, constant for the pool's lifetime.
    pub fn capacity(&self) -> usize {
        self.inner.config.node_count
    }

    /// Byte capacity of each node.
    pub fn node_size(&self) -> usize {
        self.inner.config.node_size
    }

    /// Nodes currently on the free queue.
    pub fn free_len(&self) -> usize {
        self.inner.state.lock().unwrap().free.len()
    }

    /// Nodes currently on the ready queue.
    pub fn ready_len(&self) -> usize {
        self.inner.state.lock().unwrap().ready.len()
    }

    /// Nodes currently checked out by a producer or consumer.
    pub fn checked_out(&self) -> usize {
        self.inner.state.lock().unwrap().checked_out
    }

    /// True once [`BufferPool::finish`] has been called.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().unwrap().done
    }

    fn wait<'a>(
        &self,
        cv: &Condvar,
        state: std::sync::MutexGuard<'a, PoolState>,
        deadline: Option<Instant>,
    ) -> Result<std::sync::MutexGuard<'a, PoolState>> {
        // The caller's loop re-checks the queues after every wakeup, so a
        // wakeup that races the deadline is still honored; the timeout only
        // fires on the next pass once the deadline has passed.
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout);
                }
                let (state, _) = cv.wait_timeout(state, deadline - now).unwrap();
                Ok(state)
            }
            None => Ok(cv.wait(state).unwrap()),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("BufferPool")
            .field("capacity", &self.inner.config.node_count)
            .field("node_size", &self.inner.config.node_size)
            .field("free", &state.free.len())
            .field("ready", &state.ready.len())
            .field("checked_out", &state.checked_out)
            .field("done", &state.done)
            .field("aborted", &state.aborted)
            .finish()
    }
}
