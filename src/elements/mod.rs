//! Built-in pipeline elements.
//!
//! - [`ReaderSource`] / [`WriterSink`]: byte-stream edges over any
//!   `io::Read` / `io::Write` (files, sockets, test cursors)
//! - [`Passthrough`]: identity stage for diagnostics and topology tests
//! - [`Mp3Decoder`]: MP3 frame decoder with sync recovery
//! - [`Aec`]: acoustic echo cancellation with a dual-mode reference input

pub mod aec;
pub mod io;
pub mod mp3;
pub mod passthrough;

pub use aec::{Aec, AecConfig, AecMode, EchoCanceller, NlmsCanceller};
pub use io::{ReaderSource, WriterSink};
pub use mp3::{DecodeError, DecodedFrame, FrameDecoder, Mp3Decoder, Mp3DecoderConfig};
pub use passthrough::Passthrough;
