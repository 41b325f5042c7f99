//! # Cascade
//!
//! An embedded-style audio streaming pipeline engine: independent
//! processing stages connected through typed, flow-controlled buffers,
//! each stage driven on its own thread under a common state machine.
//!
//! ## Architecture
//!
//! - **Ports** ([`port`]): three transfer disciplines — byte-stream ring
//!   buffers, discrete-frame pools and zero-buffer callbacks — behind one
//!   capability set with timeouts and abort-based cancellation
//! - **Elements** ([`element`]): a [`element::Processor`] per stage, run
//!   on a dedicated worker thread with a cooperative
//!   `run/pause/stop/terminate` state machine
//! - **Pipeline** ([`pipeline`]): registers elements by name, auto-wires
//!   adjacent pairs with the port kind the upstream declares, and fans
//!   lifecycle operations out in registration order
//! - **Event bus** ([`event`]): single-listener channel carrying state
//!   changes and stream metadata out of the data path
//! - **Stages** ([`elements`]): I/O edges, an MP3 decoder with sync-word
//!   recovery, and a dual-mode acoustic echo canceller
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use cascade::prelude::*;
//! use std::fs::File;
//!
//! let pipeline = Pipeline::new("player");
//! pipeline.register(Element::new("file", ReaderSource::new(File::open("a.mp3")?)))?;
//! pipeline.register(Element::new("mp3", Mp3Decoder::new(Default::default())?))?;
//! pipeline.register(Element::new("pcm", WriterSink::new(File::create("a.pcm")?)))?;
//! pipeline.link(&["file", "mp3", "pcm"])?;
//! pipeline.set_listener();
//! pipeline.run()?;
//! while let Some(msg) = pipeline.recv_event(std::time::Duration::from_secs(1)) {
//!     println!("{}: {}", msg.source, msg.event);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod element;
pub mod elements;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod pool;
pub mod port;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::element::{Element, ElementConfig, ElementState, ProcCtx, Processor, Progress};
    pub use crate::elements::{Aec, Mp3Decoder, Passthrough, ReaderSource, WriterSink};
    pub use crate::error::{Error, Result};
    pub use crate::event::{ElementEvent, EventMessage, StreamInfo};
    pub use crate::pipeline::{Pipeline, PipelineState};
    pub use crate::pool::{BufferPool, PoolConfig};
    pub use crate::port::{CallbackPort, FramePort, Port, PortSpec, RingPort};
}

pub use error::{Error, Result};
