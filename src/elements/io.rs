//! Byte-stream edge elements over `io::Read` / `io::Write`.
//!
//! These are the pipeline's file/VFS boundary: anything that implements
//! the std I/O traits (a `File`, a socket, a `Cursor` in tests) plugs in
//! here without the engine knowing about filesystems.

use crate::element::{ProcCtx, Processor, Progress};
use crate::error::Result;
use crate::port::PortSpec;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A source element that chunks an `io::Read` into its output port.
pub struct ReaderSource<R: Read + Send + 'static> {
    reader: R,
    scratch: Vec<u8>,
    out_spec: PortSpec,
    bytes_read: u64,
}

impl<R: Read + Send + 'static> ReaderSource<R> {
    /// Default chunk size.
    pub const DEFAULT_CHUNK_SIZE: usize = 4096;

    /// Create a source reading from `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            scratch: vec![0u8; Self::DEFAULT_CHUNK_SIZE],
            out_spec: PortSpec::Ring {
                capacity: Self::DEFAULT_CHUNK_SIZE * 4,
            },
            bytes_read: 0,
        }
    }

    /// Set the chunk size for reads.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.scratch = vec![0u8; size.max(1)];
        self
    }

    /// Override the declared output port.
    pub fn with_output_spec(mut self, spec: PortSpec) -> Self {
        self.out_spec = spec;
        self
    }

    /// Total bytes read from the reader so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl<R: Read + Send + 'static> Processor for ReaderSource<R> {
    fn process(&mut self, ctx: &mut ProcCtx) -> Result<Progress> {
        let n = self.reader.read(&mut self.scratch)?;
        if n == 0 {
            debug!(element = ctx.name(), bytes = self.bytes_read, "source exhausted");
            return Ok(Progress::Finished);
        }
        ctx.write(&self.scratch[..n])?;
        self.bytes_read += n as u64;
        Ok(Progress::Advanced)
    }

    fn output_spec(&self) -> PortSpec {
        self.out_spec.clone()
    }
}

/// A sink element that drains its input port into an `io::Write`.
///
/// Reaches `Finished` when upstream signals end of stream.
pub struct WriterSink<W: Write + Send + 'static> {
    writer: W,
    scratch: Vec<u8>,
    bytes_written: Arc<AtomicU64>,
}

impl<W: Write + Send + 'static> WriterSink<W> {
    /// Default transfer chunk size.
    pub const DEFAULT_CHUNK_SIZE: usize = 4096;

    /// Create a sink writing into `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            scratch: vec![0u8; Self::DEFAULT_CHUNK_SIZE],
            bytes_written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set the transfer chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.scratch = vec![0u8; size.max(1)];
        self
    }

    /// A shared counter of bytes delivered to the writer. Clone it before
    /// handing the sink to an element.
    pub fn byte_count(&self) -> Arc<AtomicU64> {
        self.bytes_written.clone()
    }
}

impl<W: Write + Send + 'static> Processor for WriterSink<W> {
    fn process(&mut self, ctx: &mut ProcCtx) -> Result<Progress> {
        let n = ctx.read(&mut self.scratch)?;
        if n == 0 {
            self.writer.flush()?;
            debug!(
                element = ctx.name(),
                bytes = self.bytes_written.load(Ordering::Relaxed),
                "sink drained"
            );
            return Ok(Progress::Finished);
        }
        self.writer.write_all(&self.scratch[..n])?;
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(Progress::Advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Element, ElementState};
    use crate::pipeline::Pipeline;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::time::Duration;

    /// `io::Write` into shared memory, for inspecting sink output.
    #[derive(Clone, Default)]
    pub(crate) struct SharedSink(pub(crate) Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_reader_to_writer_roundtrip() {
        let data: Vec<u8> = (0..=255u8).cycle().take(20000).collect();
        let sink_store = SharedSink::default();
        let store = sink_store.0.clone();

        let pipeline = Pipeline::new("copy");
        pipeline
            .register(Element::new(
                "src",
                ReaderSource::new(Cursor::new(data.clone())).with_chunk_size(512),
            ))
            .unwrap();
        pipeline
            .register(Element::new("sink", WriterSink::new(sink_store)))
            .unwrap();
        pipeline.link(&["src", "sink"]).unwrap();
        pipeline.run().unwrap();

        pipeline
            .element("sink")
            .unwrap()
            .wait_for_state(
                |s| s == ElementState::Finished,
                Some(Duration::from_secs(5)),
            )
            .unwrap();

        assert_eq!(*store.lock().unwrap(), data);
        pipeline.terminate();
    }

    #[test]
    fn test_byte_count_handle() {
        let sink = WriterSink::new(std::io::sink());
        let count = sink.byte_count();

        let element = Element::new("sink", sink);
        let port = crate::port::Port::ring("in", 64).unwrap();
        element.set_external_input(port.clone());

        port.write(b"123456", None).unwrap();
        port.finish();
        element.run().unwrap();
        element
            .wait_for_state(
                |s| s == ElementState::Finished,
                Some(Duration::from_secs(5)),
            )
            .unwrap();

        assert_eq!(count.load(Ordering::Relaxed), 6);
        element.terminate().unwrap();
    }
}
