//! Zero-buffer callback port.
//!
//! Used at pipeline edges: a read or write simply invokes a user-supplied
//! function with the caller's scratch buffer — a hardware FIFO, a DMA
//! engine, or a synthetic test source. The port itself has no storage and
//! no backpressure; whatever the callback does (e.g. block on the FIFO)
//! is the effective backpressure.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Read-side callback: fill the scratch buffer, return the byte count.
/// `Ok(0)` means end of stream.
pub type ReadFn = Box<dyn FnMut(&mut [u8]) -> Result<usize> + Send>;

/// Write-side callback: consume the buffer, return the bytes accepted.
pub type WriteFn = Box<dyn FnMut(&[u8]) -> Result<usize> + Send>;

struct CallbackFns {
    read: Option<ReadFn>,
    write: Option<WriteFn>,
}

/// A port that delegates directly to user functions.
///
/// Clonable handle; clones share the same callbacks (calls are serialized
/// through an internal lock).
#[derive(Clone)]
pub struct CallbackPort {
    fns: Arc<Mutex<CallbackFns>>,
    aborted: Arc<AtomicBool>,
}

impl CallbackPort {
    /// A read-only callback port (a source edge).
    pub fn reader(read: impl FnMut(&mut [u8]) -> Result<usize> + Send + 'static) -> Self {
        Self::build(Some(Box::new(read)), None)
    }

    /// A write-only callback port (a sink edge).
    pub fn writer(write: impl FnMut(&[u8]) -> Result<usize> + Send + 'static) -> Self {
        Self::build(None, Some(Box::new(write)))
    }

    /// A bidirectional callback port.
    pub fn duplex(
        read: impl FnMut(&mut [u8]) -> Result<usize> + Send + 'static,
        write: impl FnMut(&[u8]) -> Result<usize> + Send + 'static,
    ) -> Self {
        Self::build(Some(Box::new(read)), Some(Box::new(write)))
    }

    fn build(read: Option<ReadFn>, write: Option<WriteFn>) -> Self {
        Self {
            fns: Arc::new(Mutex::new(CallbackFns { read, write })),
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Invoke the read callback with `dst`.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(Error::Aborted);
        }
        let mut fns = self.fns.lock().unwrap();
        match fns.read.as_mut() {
            Some(read) => read(dst),
            None => Err(Error::Unsupported("callback port has no read function")),
        }
    }

    /// Invoke the write callback with `src`.
    pub fn write(&self, src: &[u8]) -> Result<usize> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(Error::Aborted);
        }
        let mut fns = self.fns.lock().unwrap();
        match fns.write.as_mut() {
            Some(write) => write(src),
            None => Err(Error::Unsupported("callback port has no write function")),
        }
    }

    /// Make all future calls return [`Error::Aborted`].
    ///
    /// A callback already blocked inside user code is not interrupted;
    /// unblocking the underlying resource is the callback owner's job.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Clear the abort flag.
    pub fn reset(&self) {
        self.aborted.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for CallbackPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fns = self.fns.lock().unwrap();
        f.debug_struct("CallbackPort")
            .field("has_read", &fns.read.is_some())
            .field("has_write", &fns.write.is_some())
            .field("aborted", &self.aborted.load(Ordering::Relaxed))
            .finish()
    }
}
