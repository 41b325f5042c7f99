//! Identity element.

use crate::element::{ProcCtx, Processor, Progress};
use crate::error::Result;
use crate::port::PortSpec;

/// Forwards its input unchanged. Useful as a topology placeholder and in
/// tests.
pub struct Passthrough {
    scratch: Vec<u8>,
    out_spec: PortSpec,
    bytes_forwarded: u64,
}

impl Passthrough {
    /// Default transfer chunk size.
    pub const DEFAULT_CHUNK_SIZE: usize = 4096;

    /// Create a passthrough with default sizing.
    pub fn new() -> Self {
        Self::with_chunk_size(Self::DEFAULT_CHUNK_SIZE)
    }

    /// Create a passthrough with an explicit transfer chunk size.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            scratch: vec![0u8; chunk_size.max(1)],
            out_spec: PortSpec::Ring {
                capacity: chunk_size.max(1) * 4,
            },
            bytes_forwarded: 0,
        }
    }

    /// Override the declared output port.
    pub fn with_output_spec(mut self, spec: PortSpec) -> Self {
        self.out_spec = spec;
        self
    }

    /// Total bytes forwarded so far.
    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded
    }
}

impl Default for Passthrough {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Passthrough {
    fn process(&mut self, ctx: &mut ProcCtx) -> Result<Progress> {
        let n = ctx.read(&mut self.scratch)?;
        if n == 0 {
            return Ok(Progress::Finished);
        }
        ctx.write(&self.scratch[..n])?;
        self.bytes_forwarded += n as u64;
        Ok(Progress::Advanced)
    }

    fn output_spec(&self) -> PortSpec {
        self.out_spec.clone()
    }
}
