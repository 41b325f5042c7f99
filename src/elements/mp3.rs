//! MP3 decoder element.
//!
//! The element owns the framing and failure-tolerance contract around a
//! per-frame decode backend: a read-ahead main buffer, a lazy ID3v2 tag
//! skip on the first process call, sync-word scanning, header
//! pre-validation, and forward resynchronization on corrupt data. The
//! decode math itself lives behind [`FrameDecoder`]; a
//! [symphonia](https://github.com/pdeljanov/Symphonia)-backed
//! implementation is provided with the `mp3` feature.
//!
//! The key property of the stage: malformed data is always handled by
//! discard-and-resync, never by failing the pipeline. A frame that cannot
//! be decoded costs at most its own bytes.

use crate::element::{ProcCtx, Processor, Progress};
use crate::error::{Error, Result};
use crate::event::{ElementEvent, StreamInfo};
use crate::port::PortSpec;
use std::fmt;
use tracing::{debug, trace};

// ============================================================================
// Frame decode seam
// ============================================================================

/// Soft errors a [`FrameDecoder`] reports. Each maps to a distinct
/// recovery policy in the element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The decoder needs a fuller input buffer. The element clears its
    /// main buffer and refills from the input port.
    NeedData,
    /// The frame's main data spills into the next frame (bit reservoir).
    /// The element consumes this frame and retries without clearing.
    MainDataUnderflow,
    /// The frame is unusable. The element resynchronizes forward before
    /// giving up on the buffered bytes.
    Corrupt(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::NeedData => write!(f, "input data underflow"),
            DecodeError::MainDataUnderflow => write!(f, "main data underflow"),
            DecodeError::Corrupt(msg) => write!(f, "corrupt frame: {}", msg),
        }
    }
}

/// A successfully decoded frame.
#[derive(Debug, Clone, Copy)]
pub struct DecodedFrame {
    /// Input bytes the decoder consumed (normally the whole frame).
    pub bytes_consumed: usize,
    /// Bytes of interleaved PCM written to the output buffer.
    pub pcm_len: usize,
    /// Sample rate of the decoded audio.
    pub sample_rate: u32,
    /// Channel count of the decoded audio.
    pub channels: u16,
    /// Bit depth of the decoded PCM.
    pub bits_per_sample: u16,
}

/// Per-frame decode backend.
///
/// `frame` is exactly one syncword-aligned frame as delimited by the
/// element's header parse; `pcm_out` is the element's PCM scratch buffer.
pub trait FrameDecoder: Send + 'static {
    /// Decode one frame into interleaved little-endian PCM.
    fn decode(
        &mut self,
        frame: &[u8],
        pcm_out: &mut [u8],
    ) -> std::result::Result<DecodedFrame, DecodeError>;

    /// Drop any inter-frame state (bit reservoir), e.g. after a resync.
    fn reset(&mut self) {}
}

// ============================================================================
// Frame header parsing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MpegVersion {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub(crate) frame_len: usize,
    pub(crate) samples_per_frame: usize,
    pub(crate) sample_rate: u32,
    pub(crate) channels: u16,
}

/// Layer III bitrates in kbit/s, indexed by the header's bitrate field.
const BITRATES_V1_L3: [u32; 15] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];
const BITRATES_V2_L3: [u32; 15] = [
    0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160,
];

const SAMPLE_RATES_V1: [u32; 3] = [44100, 48000, 32000];
const SAMPLE_RATES_V2: [u32; 3] = [22050, 24000, 16000];
const SAMPLE_RATES_V25: [u32; 3] = [11025, 12000, 8000];

/// Find the next frame sync word (11 set bits) in `buf`.
pub(crate) fn find_sync(buf: &[u8]) -> Option<usize> {
    buf.windows(2)
        .position(|w| w[0] == 0xFF && w[1] & 0xE0 == 0xE0)
}

/// Parse and validate a 4-byte candidate frame header.
///
/// Returns `None` for anything a decode attempt would be wasted on:
/// reserved version or layer, bad bitrate/sample-rate index. Free-format
/// streams (bitrate index 0) are rejected too — their frame length cannot
/// be derived from the header.
pub(crate) fn parse_frame_header(b: &[u8]) -> Option<FrameHeader> {
    if b.len() < 4 || b[0] != 0xFF || b[1] & 0xE0 != 0xE0 {
        return None;
    }

    let version = match (b[1] >> 3) & 0x3 {
        0 => MpegVersion::Mpeg25,
        2 => MpegVersion::Mpeg2,
        3 => MpegVersion::Mpeg1,
        _ => return None,
    };
    // Layer III only.
    if (b[1] >> 1) & 0x3 != 1 {
        return None;
    }

    let bitrate_idx = ((b[2] >> 4) & 0xF) as usize;
    if bitrate_idx == 0 || bitrate_idx == 15 {
        return None;
    }
    let sr_idx = ((b[2] >> 2) & 0x3) as usize;
    if sr_idx == 3 {
        return None;
    }
    let padding = ((b[2] >> 1) & 0x1) as usize;

    let (bitrate, sample_rate, slots, samples) = match version {
        MpegVersion::Mpeg1 => (
            BITRATES_V1_L3[bitrate_idx] * 1000,
            SAMPLE_RATES_V1[sr_idx],
            144,
            1152,
        ),
        MpegVersion::Mpeg2 => (
            BITRATES_V2_L3[bitrate_idx] * 1000,
            SAMPLE_RATES_V2[sr_idx],
            72,
            576,
        ),
        MpegVersion::Mpeg25 => (
            BITRATES_V2_L3[bitrate_idx] * 1000,
            SAMPLE_RATES_V25[sr_idx],
            72,
            576,
        ),
    };

    let channels = if (b[3] >> 6) & 0x3 == 3 { 1 } else { 2 };
    let frame_len = (slots * bitrate / sample_rate) as usize + padding;

    Some(FrameHeader {
        frame_len,
        samples_per_frame: samples,
        sample_rate,
        channels,
    })
}

/// ID3v2 tag size from a 10-byte header, or `None` if the magic is absent.
///
/// The size field is four 7-bit (syncsafe) bytes and excludes the header
/// itself.
pub(crate) fn parse_id3v2_size(b: &[u8]) -> Option<usize> {
    if b.len() < 10 || &b[..3] != b"ID3" {
        return None;
    }
    let size = ((b[6] & 0x7F) as usize) << 21
        | ((b[7] & 0x7F) as usize) << 14
        | ((b[8] & 0x7F) as usize) << 7
        | (b[9] & 0x7F) as usize;
    Some(size)
}

// ============================================================================
// The element
// ============================================================================

/// MP3 decoder element configuration.
#[derive(Debug, Clone)]
pub struct Mp3DecoderConfig {
    /// Capacity of the read-ahead main buffer. Must hold at least one
    /// maximum-size frame with room to spare.
    pub main_buf_size: usize,
    /// Capacity of the decoded-PCM scratch buffer.
    pub pcm_buf_size: usize,
    /// The output port to auto-create when linked.
    pub out_spec: PortSpec,
}

impl Default for Mp3DecoderConfig {
    fn default() -> Self {
        Self {
            main_buf_size: 4096,
            // One MPEG-1 Layer III frame: 1152 samples x 2 ch x 16 bit.
            pcm_buf_size: 4608,
            out_spec: PortSpec::Ring { capacity: 4 * 4608 },
        }
    }
}

/// Minimum main buffer: a maximum-size Layer III frame is 1441 bytes and
/// the scanner needs slack past it.
const MIN_MAIN_BUF: usize = 2048;
/// Minimum PCM buffer: one MPEG-1 stereo frame.
const MIN_PCM_BUF: usize = 4608;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Id3 {
    Unchecked,
    Skipping(usize),
    Done,
}

/// The MP3 decoder stage. See the module docs for the recovery contract.
pub struct Mp3Decoder {
    config: Mp3DecoderConfig,
    decoder: Box<dyn FrameDecoder>,
    main: Vec<u8>,
    pcm: Vec<u8>,
    id3: Id3,
    eos: bool,
    last_info: Option<StreamInfo>,
    frames_decoded: u64,
}

impl Mp3Decoder {
    /// Create a decoder element with the symphonia backend.
    #[cfg(feature = "mp3")]
    pub fn new(config: Mp3DecoderConfig) -> Result<Self> {
        let backend = SymphoniaMp3Decoder::new()?;
        Self::with_decoder(config, Box::new(backend))
    }

    /// Create a decoder element with an explicit decode backend.
    pub fn with_decoder(config: Mp3DecoderConfig, decoder: Box<dyn FrameDecoder>) -> Result<Self> {
        if config.main_buf_size < MIN_MAIN_BUF {
            return Err(Error::InvalidConfig(format!(
                "main buffer of {} bytes cannot hold a frame (minimum {})",
                config.main_buf_size, MIN_MAIN_BUF
            )));
        }
        if config.pcm_buf_size < MIN_PCM_BUF {
            return Err(Error::InvalidConfig(format!(
                "PCM buffer of {} bytes cannot hold a decoded frame (minimum {})",
                config.pcm_buf_size, MIN_PCM_BUF
            )));
        }
        let main = Vec::with_capacity(config.main_buf_size);
        let pcm = vec![0u8; config.pcm_buf_size];
        Ok(Self {
            config,
            decoder,
            main,
            pcm,
            id3: Id3::Unchecked,
            eos: false,
            last_info: None,
            frames_decoded: 0,
        })
    }

    /// Refill the main buffer from the input port.
    ///
    /// Timeout with nothing buffered is propagated (the runner retries);
    /// timeout with buffered data falls through so decoding can continue
    /// on what is already here.
    fn top_up(&mut self, ctx: &mut ProcCtx) -> Result<()> {
        if self.eos || self.main.len() >= self.config.main_buf_size {
            return Ok(());
        }
        let old = self.main.len();
        self.main.resize(self.config.main_buf_size, 0);
        match ctx.read(&mut self.main[old..]) {
            Ok(0) => {
                self.main.truncate(old);
                self.eos = true;
                debug!(buffered = old, "input stream ended, draining");
            }
            Ok(n) => self.main.truncate(old + n),
            Err(e) => {
                self.main.truncate(old);
                if !(e.is_transient() && old > 0) {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Consume the front of the main buffer.
    fn consume(&mut self, n: usize) {
        self.main.drain(..n.min(self.main.len()));
    }

    /// The not-yet-started / underfed verdict: keep draining at EOS,
    /// otherwise come back for more bytes.
    fn more(&self) -> Progress {
        if self.eos && self.main.is_empty() {
            Progress::Finished
        } else {
            Progress::Advanced
        }
    }

    /// Lazy ID3v2 handling. Returns `true` while the tag (or the decision
    /// about it) still consumes this process call.
    fn skip_id3(&mut self) -> bool {
        match self.id3 {
            Id3::Done => false,
            Id3::Skipping(remaining) => {
                let drop = remaining.min(self.main.len());
                self.consume(drop);
                self.id3 = if remaining == drop {
                    Id3::Done
                } else {
                    Id3::Skipping(remaining - drop)
                };
                true
            }
            Id3::Unchecked => {
                if self.main.len() < 3 && !self.eos {
                    return true;
                }
                if self.main.len() >= 3 && &self.main[..3] == b"ID3" {
                    if self.main.len() < 10 {
                        if self.eos {
                            // Truncated tag header at end of stream.
                            self.main.clear();
                            self.id3 = Id3::Done;
                        }
                        return true;
                    }
                    let size = parse_id3v2_size(&self.main[..10]).unwrap_or(0);
                    trace!(tag_bytes = size + 10, "skipping ID3v2 tag");
                    self.id3 = Id3::Skipping(size + 10);
                    return true;
                }
                self.id3 = Id3::Done;
                false
            }
        }
    }
}

impl Processor for Mp3Decoder {
    fn open(&mut self, _ctx: &mut ProcCtx) -> Result<()> {
        // A fresh run decodes a fresh stream. Nothing here may block
        // waiting for data; the ID3 skip is deferred to the first
        // process call.
        self.main.clear();
        self.id3 = Id3::Unchecked;
        self.eos = false;
        self.last_info = None;
        self.frames_decoded = 0;
        self.decoder.reset();
        Ok(())
    }

    fn process(&mut self, ctx: &mut ProcCtx) -> Result<Progress> {
        self.top_up(ctx)?;

        if self.main.is_empty() {
            return Ok(self.more());
        }
        if self.skip_id3() {
            return Ok(self.more());
        }

        // Locate the next candidate frame.
        let Some(pos) = find_sync(&self.main) else {
            // Not yet resynchronized: none of these bytes can start a
            // frame, so the whole buffer goes.
            trace!(discarded = self.main.len(), "no sync word in buffer");
            self.main.clear();
            return Ok(self.more());
        };
        if pos > 0 {
            trace!(skipped = pos, "aligned to sync word");
            self.consume(pos);
        }
        if self.main.len() < 4 {
            return Ok(self.more());
        }

        let Some(header) = parse_frame_header(&self.main[..4]) else {
            // A sync word with an implausible header; advance one byte
            // and keep scanning rather than failing outright.
            self.consume(1);
            return Ok(Progress::Advanced);
        };

        if header.frame_len > self.config.main_buf_size {
            self.consume(1);
            return Ok(Progress::Advanced);
        }
        if self.main.len() < header.frame_len {
            if self.eos {
                trace!(
                    have = self.main.len(),
                    need = header.frame_len,
                    "dropping partial trailing frame"
                );
                self.main.clear();
                return Ok(Progress::Finished);
            }
            return Ok(Progress::Advanced);
        }

        match self
            .decoder
            .decode(&self.main[..header.frame_len], &mut self.pcm)
        {
            Ok(frame) => {
                let consumed = match frame.bytes_consumed {
                    0 => header.frame_len,
                    n => n.min(header.frame_len),
                };
                self.consume(consumed);
                self.frames_decoded += 1;

                let info = StreamInfo {
                    sample_rate: frame.sample_rate,
                    channels: frame.channels,
                    bits_per_sample: frame.bits_per_sample,
                };
                if self.last_info != Some(info) {
                    debug!(%info, "decoded stream info");
                    ctx.notify(ElementEvent::StreamInfo(info));
                    self.last_info = Some(info);
                }
                if frame.pcm_len > 0 {
                    ctx.write(&self.pcm[..frame.pcm_len])?;
                }
                Ok(Progress::Advanced)
            }
            Err(DecodeError::NeedData) => {
                trace!("decoder wants a fuller buffer");
                self.main.clear();
                Ok(self.more())
            }
            Err(DecodeError::MainDataUnderflow) => {
                // The frame went into the bit reservoir; the bytes it
                // still needs arrive with the next frame.
                trace!("main data underflow, keeping buffer");
                self.consume(header.frame_len);
                Ok(Progress::Advanced)
            }
            Err(DecodeError::Corrupt(msg)) => {
                match find_sync(&self.main[1..]) {
                    Some(rel) => {
                        debug!(skipped = rel + 1, error = %msg, "resynchronizing past corrupt frame");
                        self.consume(rel + 1);
                    }
                    None => {
                        debug!(discarded = self.main.len(), error = %msg, "no resync point, discarding buffer");
                        ctx.notify(ElementEvent::DecodeError { message: msg });
                        self.main.clear();
                    }
                }
                self.decoder.reset();
                Ok(self.more())
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        debug!(frames = self.frames_decoded, "decoder closed");
        Ok(())
    }

    fn output_spec(&self) -> PortSpec {
        self.config.out_spec.clone()
    }
}

// ============================================================================
// Symphonia backend
// ============================================================================

#[cfg(feature = "mp3")]
mod symphonia_backend {
    use super::{DecodeError, DecodedFrame, FrameDecoder};
    use crate::error::{Error, Result};
    use symphonia::core::audio::{SampleBuffer, SignalSpec};
    use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_MP3};
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::Packet;

    /// Per-frame MP3 decode via symphonia (pure Rust).
    pub struct SymphoniaMp3Decoder {
        decoder: Box<dyn Decoder>,
        sample_buf: Option<SampleBuffer<i16>>,
        buf_spec: Option<SignalSpec>,
        ts: u64,
    }

    impl SymphoniaMp3Decoder {
        /// Instantiate the decoder from symphonia's codec registry.
        pub fn new() -> Result<Self> {
            let mut params = CodecParameters::new();
            params.for_codec(CODEC_TYPE_MP3);
            let decoder = symphonia::default::get_codecs()
                .make(&params, &DecoderOptions::default())
                .map_err(|e| Error::Element(format!("mp3 decoder init failed: {}", e)))?;
            Ok(Self {
                decoder,
                sample_buf: None,
                buf_spec: None,
                ts: 0,
            })
        }
    }

    impl FrameDecoder for SymphoniaMp3Decoder {
        fn decode(
            &mut self,
            frame: &[u8],
            pcm_out: &mut [u8],
        ) -> std::result::Result<DecodedFrame, DecodeError> {
            let packet = Packet::new_from_slice(0, self.ts, 0, frame);
            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Err(DecodeError::NeedData);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    return Err(DecodeError::Corrupt("decoder reset required".into()));
                }
                Err(SymphoniaError::DecodeError(msg)) => {
                    return Err(DecodeError::Corrupt(msg.to_string()));
                }
                Err(e) => return Err(DecodeError::Corrupt(e.to_string())),
            };

            let spec = *decoded.spec();
            let frames = decoded.frames();
            if frames == 0 {
                // The frame fed the bit reservoir without producing audio.
                self.ts += 1;
                return Err(DecodeError::MainDataUnderflow);
            }

            let needs_new = match (&self.sample_buf, self.buf_spec) {
                (Some(buf), Some(prev)) => {
                    prev.rate != spec.rate
                        || prev.channels != spec.channels
                        || buf.capacity() < decoded.capacity() * spec.channels.count()
                }
                _ => true,
            };
            if needs_new {
                self.sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
                self.buf_spec = Some(spec);
            }
            let sample_buf = self.sample_buf.as_mut().unwrap();
            sample_buf.copy_interleaved_ref(decoded);
            let samples = sample_buf.samples();

            let needed = samples.len() * 2;
            if needed > pcm_out.len() {
                return Err(DecodeError::Corrupt(format!(
                    "decoded block of {} bytes exceeds the PCM buffer",
                    needed
                )));
            }
            for (dst, sample) in pcm_out.chunks_exact_mut(2).zip(samples.iter()) {
                dst.copy_from_slice(&sample.to_le_bytes());
            }

            self.ts += 1;
            Ok(DecodedFrame {
                bytes_consumed: frame.len(),
                pcm_len: needed,
                sample_rate: spec.rate,
                channels: spec.channels.count() as u16,
                bits_per_sample: 16,
            })
        }

        fn reset(&mut self) {
            self.decoder.reset();
        }
    }
}

#[cfg(feature = "mp3")]
pub use symphonia_backend::SymphoniaMp3Decoder;
