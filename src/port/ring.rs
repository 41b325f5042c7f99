//! Byte-oriented ring buffer port.
//!
//! The ring is the unit of transfer for raw PCM streams: a contiguous byte
//! buffer with blocking/timeout read and write. A continuous (DMA-style)
//! addressing mode lets a hardware-fed producer keep writing without wrap
//! logic or backpressure; the ring overwrites its oldest bytes instead.

use crate::error::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::trace;

struct RingState {
    buf: Box<[u8]>,
    /// Read position.
    head: usize,
    /// Bytes currently stored.
    len: usize,
    done: bool,
    aborted: bool,
    continuous: bool,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn copy_out(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len);
        let cap = self.capacity();
        let first = n.min(cap - self.head);
        dst[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        if first < n {
            dst[first..n].copy_from_slice(&self.buf[..n - first]);
        }
        self.head = (self.head + n) % cap;
        self.len -= n;
        n
    }

    fn copy_in(&mut self, src: &[u8]) -> usize {
        let free = self.capacity() - self.len;
        let n = src.len().min(free);
        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;
        let first = n.min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&src[..first]);
        if first < n {
            self.buf[..n - first].copy_from_slice(&src[first..n]);
        }
        self.len += n;
        n
    }

    /// Continuous-mode write: never blocks, the oldest bytes give way.
    fn copy_in_overwrite(&mut self, src: &[u8]) {
        let cap = self.capacity();
        // Only the last `cap` bytes can survive anyway.
        let src = if src.len() > cap {
            &src[src.len() - cap..]
        } else {
            src
        };
        let free = cap - self.len;
        if src.len() > free {
            let evict = src.len() - free;
            self.head = (self.head + evict) % cap;
            self.len -= evict;
        }
        let n = self.copy_in(src);
        debug_assert_eq!(n, src.len());
    }
}

struct RingInner {
    state: Mutex<RingState>,
    readable: Condvar,
    writable: Condvar,
}

/// A circular byte buffer with blocking read/write and optional
/// continuous (DMA-style) addressing.
///
/// Cheap-clone handle; all clones share the same ring.
#[derive(Clone)]
pub struct RingPort {
    inner: Arc<RingInner>,
}

impl RingPort {
    /// Create a ring with the given byte capacity.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig("ring capacity must be > 0".into()));
        }
        Ok(Self {
            inner: Arc::new(RingInner {
                state: Mutex::new(RingState {
                    buf: vec![0u8; capacity].into_boxed_slice(),
                    head: 0,
                    len: 0,
                    done: false,
                    aborted: false,
                    continuous: false,
                }),
                readable: Condvar::new(),
                writable: Condvar::new(),
            }),
        })
    }

    /// Read up to `dst.len()` bytes, blocking up to `timeout` until at
    /// least one byte is available.
    ///
    /// Returns whatever is available once woken (it does not wait for a
    /// full `dst`). `Ok(0)` means end-of-stream: the writer called
    /// [`RingPort::finish`] and the ring has drained.
    pub fn read(&self, dst: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.aborted {
                return Err(Error::Aborted);
            }
            if state.len > 0 {
                let n = state.copy_out(dst);
                self.inner.writable.notify_one();
                return Ok(n);
            }
            if state.done {
                return Ok(0);
            }
            state = wait(&self.inner.readable, state, deadline)?;
        }
    }

    /// Non-blocking read: returns immediately with whatever is available,
    /// `Err(Timeout)` if the ring is empty, or `Ok(0)` at end-of-stream.
    pub fn try_read(&self, dst: &mut [u8]) -> Result<usize> {
        self.read(dst, Some(Duration::ZERO))
    }

    /// Write as much of `src` as fits, blocking up to `timeout` for free
    /// space until everything is written.
    ///
    /// Returns the number of bytes written; on timeout with partial
    /// progress the short count is returned, with no progress at all
    /// `Err(Timeout)`. In continuous mode the write always completes
    /// immediately, overwriting the oldest bytes if needed.
    pub fn write(&self, src: &[u8], timeout: Option<Duration>) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock().unwrap();
        let mut written = 0;
        loop {
            if state.aborted {
                return Err(Error::Aborted);
            }
            if state.done {
                return Err(Error::Element("write into a finished ring".into()));
            }
            if state.continuous {
                state.copy_in_overwrite(&src[written..]);
                self.inner.readable.notify_one();
                return Ok(src.len());
            }
            let n = state.copy_in(&src[written..]);
            if n > 0 {
                written += n;
                self.inner.readable.notify_one();
            }
            if written == src.len() {
                return Ok(written);
            }
            state = match wait(&self.inner.writable, state, deadline) {
                Ok(state) => state,
                Err(Error::Timeout) if written > 0 => return Ok(written),
                Err(e) => return Err(e),
            };
        }
    }

    /// Switch continuous (looping) addressing on or off.
    ///
    /// In continuous mode writes never block and the logical buffer wraps
    /// without the producer needing explicit wrap handling.
    pub fn set_continuous(&self, continuous: bool) {
        let mut state = self.inner.state.lock().unwrap();
        state.continuous = continuous;
    }

    /// Mark the stream done: readers drain the remaining bytes, then see
    /// `Ok(0)` instead of blocking forever.
    pub fn finish(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.done = true;
        self.inner.readable.notify_all();
    }

    /// Abort the ring: all pending and future blocking calls return
    /// [`Error::Aborted`] immediately.
    pub fn abort(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.aborted = true;
        self.inner.readable.notify_all();
        self.inner.writable.notify_all();
        trace!("ring aborted");
    }

    /// Drop all buffered bytes and clear the done/abort flags.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.head = 0;
        state.len = 0;
        state.done = false;
        state.aborted = false;
        self.inner.writable.notify_all();
    }

    /// Bytes of free space.
    pub fn free_space(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.capacity() - state.len
    }

    /// Bytes currently buffered.
    pub fn fill_level(&self) -> usize {
        self.inner.state.lock().unwrap().len
    }

    /// Total byte capacity.
    pub fn capacity(&self) -> usize {
        self.inner.state.lock().unwrap().capacity()
    }

    /// True once [`RingPort::finish`] has been called.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().unwrap().done
    }
}

fn wait<'a>(
    cv: &Condvar,
    state: MutexGuard<'a, RingState>,
    deadline: Option<Instant>,
) -> Result<MutexGuard<'a, RingState>> {
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

impl std::fmt::Debug for RingPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("RingPort")
            .field("capacity", &state.capacity())
            .field("fill", &state.len)
            .field("done", &state.done)
            .field("aborted", &state.aborted)
            .field("continuous", &state.continuous)
            .finish()
    }
}
