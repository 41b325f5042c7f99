//! Error types for cascade.

use thiserror::Error;

/// Result type alias using cascade's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cascade operations.
///
/// `Timeout` and `Aborted` are verdicts, not failures: a timed-out port or
/// pool call is retried at the caller's own policy, and an aborted call
/// means somebody requested shutdown on that resource. Everything else is
/// a real error.
#[derive(Error, Debug)]
pub enum Error {
    /// A blocking port or pool operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// A blocking port or pool operation was aborted.
    #[error("operation aborted")]
    Aborted,

    /// Invalid configuration passed to a constructor.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Buffer or pool allocation failed at construction time.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// A frame does not fit the reader's buffer.
    #[error("frame ({frame} bytes) exceeds destination capacity ({capacity} bytes)")]
    FrameTooLarge {
        /// Length of the frame that was ready.
        frame: usize,
        /// Capacity of the destination buffer.
        capacity: usize,
    },

    /// A processor needed a port that is not wired.
    #[error("element has no {0} port")]
    NoPort(&'static str),

    /// The operation is not supported by this element.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// An element name was not found in the pipeline registry.
    #[error("unknown element: {0}")]
    UnknownElement(String),

    /// Fatal element-level failure.
    #[error("element error: {0}")]
    Element(String),

    /// Pipeline-level failure.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the transient verdicts a stage retries on its own policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// True when the operation was cut short by an abort request.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
