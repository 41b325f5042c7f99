//! Typed connections between elements.
//!
//! Three port disciplines carry data through the graph:
//!
//! - [`RingPort`]: byte-stream ring buffer (raw PCM)
//! - [`FramePort`]: discrete frames over a buffer pool (encoded audio)
//! - [`CallbackPort`]: zero-buffer adapter calling user functions (edges)
//!
//! [`Port`] wraps the three behind one capability set (read, write,
//! free-space, fill-level, reset, plus abort/finish for shutdown), which
//! is what the element framework and the pipeline auto-wiring work with.

mod callback;
mod frame;
mod ring;

pub use callback::{CallbackPort, ReadFn, WriteFn};
pub use frame::FramePort;
pub use ring::RingPort;

use crate::error::Result;
use crate::pool::PoolConfig;
use std::sync::Arc;
use std::time::Duration;

/// The discipline of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// Byte-stream ring buffer.
    Ring,
    /// Discrete frames over a buffer pool.
    Frame,
    /// Direct user-callback adapter.
    Callback,
}

/// What an element declares about the output port it wants.
///
/// The pipeline consumes this when auto-wiring two registered elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    /// A ring port with the given byte capacity.
    Ring {
        /// Byte capacity of the ring.
        capacity: usize,
    },
    /// A frame port with the given pool sizing.
    Frame(PoolConfig),
    /// No auto-created port: the element's output (if any) is owned and
    /// wired externally, e.g. a hardware FIFO callback or nothing at all
    /// for a terminal sink.
    External,
}

enum PortImpl {
    Ring(RingPort),
    Frame(FramePort),
    Callback(CallbackPort),
}

/// A typed, named connection endpoint. Cheap-clone handle.
#[derive(Clone)]
pub struct Port {
    name: Arc<str>,
    imp: Arc<PortImpl>,
}

impl Port {
    /// Create a ring port.
    pub fn ring(name: impl Into<String>, capacity: usize) -> Result<Self> {
        Ok(Self {
            name: name.into().into(),
            imp: Arc::new(PortImpl::Ring(RingPort::new(capacity)?)),
        })
    }

    /// Create a frame port with its own pool.
    pub fn frame(name: impl Into<String>, config: PoolConfig) -> Result<Self> {
        Ok(Self {
            name: name.into().into(),
            imp: Arc::new(PortImpl::Frame(FramePort::new(config)?)),
        })
    }

    /// Wrap a callback port.
    pub fn callback(name: impl Into<String>, port: CallbackPort) -> Self {
        Self {
            name: name.into().into(),
            imp: Arc::new(PortImpl::Callback(port)),
        }
    }

    /// Create the port a [`PortSpec`] describes, or `None` for
    /// [`PortSpec::External`].
    pub fn from_spec(name: impl Into<String>, spec: &PortSpec) -> Result<Option<Self>> {
        match spec {
            PortSpec::Ring { capacity } => Self::ring(name, *capacity).map(Some),
            PortSpec::Frame(config) => Self::frame(name, *config).map(Some),
            PortSpec::External => Ok(None),
        }
    }

    /// Diagnostic name (e.g. `"decoder->sink"`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The port's discipline.
    pub fn kind(&self) -> PortKind {
        match &*self.imp {
            PortImpl::Ring(_) => PortKind::Ring,
            PortImpl::Frame(_) => PortKind::Frame,
            PortImpl::Callback(_) => PortKind::Callback,
        }
    }

    /// Read up to `dst.len()` bytes.
    ///
    /// Ring: whatever is available after at most one wait. Frame: exactly
    /// one whole frame (`dst` must hold it). Callback: whatever the user
    /// function returns. `Ok(0)` always means end of stream.
    pub fn read(&self, dst: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        match &*self.imp {
            PortImpl::Ring(ring) => ring.read(dst, timeout),
            PortImpl::Frame(frame) => frame.read(dst, timeout),
            PortImpl::Callback(cb) => cb.read(dst),
        }
    }

    /// Non-blocking read.
    pub fn try_read(&self, dst: &mut [u8]) -> Result<usize> {
        match &*self.imp {
            PortImpl::Ring(ring) => ring.try_read(dst),
            PortImpl::Frame(frame) => frame.read(dst, Some(Duration::ZERO)),
            PortImpl::Callback(cb) => cb.read(dst),
        }
    }

    /// Write `src`.
    ///
    /// Ring: as many bytes as fit within the timeout (short count on
    /// partial progress). Frame: the whole slice as one frame. Callback:
    /// whatever the user function accepts.
    pub fn write(&self, src: &[u8], timeout: Option<Duration>) -> Result<usize> {
        match &*self.imp {
            PortImpl::Ring(ring) => ring.write(src, timeout),
            PortImpl::Frame(frame) => frame.write(src, timeout),
            PortImpl::Callback(cb) => cb.write(src),
        }
    }

    /// Non-blocking write (used for best-effort fan-out).
    pub fn try_write(&self, src: &[u8]) -> Result<usize> {
        match &*self.imp {
            PortImpl::Ring(ring) => ring.write(src, Some(Duration::ZERO)),
            PortImpl::Frame(frame) => frame.write(src, Some(Duration::ZERO)),
            PortImpl::Callback(cb) => cb.write(src),
        }
    }

    /// Free space: bytes for a ring, free nodes for a frame port, 0 for a
    /// callback port (no storage).
    pub fn free_space(&self) -> usize {
        match &*self.imp {
            PortImpl::Ring(ring) => ring.free_space(),
            PortImpl::Frame(frame) => frame.free_space(),
            PortImpl::Callback(_) => 0,
        }
    }

    /// Fill level: buffered bytes for a ring, ready frames for a frame
    /// port, 0 for a callback port.
    pub fn fill_level(&self) -> usize {
        match &*self.imp {
            PortImpl::Ring(ring) => ring.fill_level(),
            PortImpl::Frame(frame) => frame.fill_level(),
            PortImpl::Callback(_) => 0,
        }
    }

    /// Mark the stream done-writing; readers drain then see `Ok(0)`.
    pub fn finish(&self) {
        match &*self.imp {
            PortImpl::Ring(ring) => ring.finish(),
            PortImpl::Frame(frame) => frame.finish(),
            PortImpl::Callback(_) => {}
        }
    }

    /// Abort: all pending and future blocking calls return
    /// [`Error::Aborted`](crate::error::Error::Aborted) immediately.
    pub fn abort(&self) {
        match &*self.imp {
            PortImpl::Ring(ring) => ring.abort(),
            PortImpl::Frame(frame) => frame.abort(),
            PortImpl::Callback(cb) => cb.abort(),
        }
    }

    /// Clear buffered data and the done/abort flags.
    pub fn reset(&self) {
        match &*self.imp {
            PortImpl::Ring(ring) => ring.reset(),
            PortImpl::Frame(frame) => frame.reset(),
            PortImpl::Callback(cb) => cb.reset(),
        }
    }

    /// Frame-level access, when the port is a frame port.
    pub fn as_frame(&self) -> Option<&FramePort> {
        match &*self.imp {
            PortImpl::Frame(frame) => Some(frame),
            _ => None,
        }
    }

    /// Ring-level access, when the port is a ring port.
    pub fn as_ring(&self) -> Option<&RingPort> {
        match &*self.imp {
            PortImpl::Ring(ring) => Some(ring),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("fill", &self.fill_level())
            .finish()
    }
}
