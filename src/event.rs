//! Single-listener event bus for cross-stage notification.
//!
//! Elements publish status reports (state changes, decoded-stream metadata,
//! decode errors) to the bus instead of threading them through the data
//! path. Exactly one listener drains the bus — typically the pipeline,
//! which re-publishes to application code via [`crate::pipeline::Pipeline::recv_event`].
//!
//! Ordering: messages from one publisher are observed in publish order.
//! Nothing is guaranteed across publishers, and consumers must not assume
//! it.

use crate::element::ElementState;
use crate::pipeline::PipelineState;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Decoded-stream parameters, reported by codec stages when they change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of channels.
    pub channels: u16,
    /// Bits per sample of the decoded PCM.
    pub bits_per_sample: u16,
}

impl fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {} bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

/// Status reports carried by the bus.
#[derive(Debug, Clone)]
pub enum ElementEvent {
    /// An element entered a new state.
    StateChanged(ElementState),
    /// Decoded-stream metadata changed.
    StreamInfo(StreamInfo),
    /// A codec stage hit malformed data it could not resynchronize past.
    DecodeError {
        /// Human-readable description of the failure.
        message: String,
    },
    /// The pipeline itself changed state.
    PipelineState(PipelineState),
}

impl fmt::Display for ElementEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementEvent::StateChanged(state) => write!(f, "state -> {:?}", state),
            ElementEvent::StreamInfo(info) => write!(f, "stream info: {}", info),
            ElementEvent::DecodeError { message } => write!(f, "decode error: {}", message),
            ElementEvent::PipelineState(state) => write!(f, "pipeline -> {:?}", state),
        }
    }
}

/// One bus message: a pure notification value, consumed at most once.
#[derive(Debug, Clone)]
pub struct EventMessage {
    /// Name of the element (or pipeline) that published the report.
    pub source: String,
    /// The report itself.
    pub event: ElementEvent,
}

/// Create a bus with the given queue capacity.
///
/// Returns the publisher half (clonable, handed to elements) and the single
/// listener half.
pub fn channel(capacity: usize) -> (EventPublisher, EventListener) {
    let (tx, rx) = kanal::bounded(capacity);
    (EventPublisher { tx }, EventListener { rx })
}

/// Publisher half of the bus. Cheap to clone; one per element.
#[derive(Clone)]
pub struct EventPublisher {
    tx: kanal::Sender<EventMessage>,
}

impl EventPublisher {
    /// Publish a report.
    ///
    /// Never blocks the data path: if the listener has fallen behind and
    /// the queue is full, the message is dropped with a warning.
    pub fn notify(&self, source: &str, event: ElementEvent) {
        let msg = EventMessage {
            source: source.to_string(),
            event,
        };
        match self.tx.try_send(msg) {
            Ok(true) => {}
            Ok(false) => warn!(source, "event bus full, report dropped"),
            Err(_) => debug!(source, "event bus closed, report dropped"),
        }
    }
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher").finish()
    }
}

/// Listener half of the bus. There is exactly one.
pub struct EventListener {
    rx: kanal::Receiver<EventMessage>,
}

impl EventListener {
    /// Wait up to `timeout` for the next report.
    pub fn recv(&self, timeout: Duration) -> Option<EventMessage> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Take the next report without blocking.
    pub fn try_recv(&self) -> Option<EventMessage> {
        self.rx.try_recv().ok().flatten()
    }
}

impl fmt::Debug for EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListener")
            .field("pending", &self.rx.len())
            .finish()
    }
}
