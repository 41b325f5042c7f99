//! Integration tests for the cascade pipeline engine.

use cascade::element::{Element, ElementState, ProcCtx, Processor, Progress};
use cascade::elements::{
    DecodeError, DecodedFrame, FrameDecoder, Mp3Decoder, Mp3DecoderConfig, Passthrough,
    ReaderSource, WriterSink,
};
use cascade::error::Result;
use cascade::event::ElementEvent;
use cascade::pipeline::{Pipeline, PipelineState};
use cascade::pool::PoolConfig;
use cascade::port::PortSpec;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Header of an MPEG-1 Layer III frame: 128 kbit/s, 44.1 kHz, joint
/// stereo, no padding. Frame length 417 bytes, 1152 samples per frame.
const FRAME_HDR: [u8; 4] = [0xFF, 0xFB, 0x90, 0x44];
const FRAME_LEN: usize = 417;
const PCM_PER_FRAME: usize = 1152 * 2 * 2;

fn mp3_frame(seed: u8) -> Vec<u8> {
    let mut frame = FRAME_HDR.to_vec();
    frame.resize(FRAME_LEN, seed);
    frame
}

fn id3_tag(body_len: usize) -> Vec<u8> {
    let mut tag = b"ID3\x04\x00\x00".to_vec();
    tag.push(((body_len >> 21) & 0x7F) as u8);
    tag.push(((body_len >> 14) & 0x7F) as u8);
    tag.push(((body_len >> 7) & 0x7F) as u8);
    tag.push((body_len & 0x7F) as u8);
    tag.resize(10 + body_len, 0x5A);
    tag
}

/// Stand-in for the decode library: emits a fixed PCM block per frame and
/// trusts the element's framing.
struct FixedPcmDecoder;

impl FrameDecoder for FixedPcmDecoder {
    fn decode(
        &mut self,
        frame: &[u8],
        pcm_out: &mut [u8],
    ) -> std::result::Result<DecodedFrame, DecodeError> {
        assert_eq!(frame.len(), FRAME_LEN, "element must feed whole frames");
        pcm_out[..PCM_PER_FRAME].fill(frame[4]);
        Ok(DecodedFrame {
            bytes_consumed: frame.len(),
            pcm_len: PCM_PER_FRAME,
            sample_rate: 44100,
            channels: 2,
            bits_per_sample: 16,
        })
    }
}

/// `io::Write` into shared memory, for inspecting sink output.
#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A source that produces fixed blocks forever, until stopped.
struct EndlessSource;

impl Processor for EndlessSource {
    fn process(&mut self, ctx: &mut ProcCtx) -> Result<Progress> {
        ctx.write(&[0u8; 256])?;
        Ok(Progress::Advanced)
    }

    fn output_spec(&self) -> PortSpec {
        PortSpec::Ring { capacity: 4096 }
    }
}

/// A sink that counts and discards.
struct CountingSink {
    consumed: Arc<AtomicUsize>,
}

impl Processor for CountingSink {
    fn process(&mut self, ctx: &mut ProcCtx) -> Result<Progress> {
        let mut buf = [0u8; 1024];
        let n = ctx.read(&mut buf)?;
        if n == 0 {
            return Ok(Progress::Finished);
        }
        self.consumed.fetch_add(n, Ordering::Relaxed);
        Ok(Progress::Advanced)
    }
}

/// Build `source -> mp3 -> sink` over a synthetic MP3 byte stream.
fn mp3_pipeline(stream: Vec<u8>) -> (Pipeline, Arc<Mutex<Vec<u8>>>) {
    let pipeline = Pipeline::new("player");
    let store = SharedSink::default();
    let pcm = store.0.clone();

    pipeline
        .register(Element::new(
            "source",
            ReaderSource::new(Cursor::new(stream)).with_chunk_size(512),
        ))
        .unwrap();
    pipeline
        .register(Element::new(
            "mp3",
            Mp3Decoder::with_decoder(Mp3DecoderConfig::default(), Box::new(FixedPcmDecoder))
                .unwrap(),
        ))
        .unwrap();
    pipeline
        .register(Element::new("sink", WriterSink::new(store)))
        .unwrap();
    pipeline.link(&["source", "mp3", "sink"]).unwrap();
    pipeline.set_listener();
    (pipeline, pcm)
}

/// The full §end-to-end scenario: a valid stream followed by clean
/// end-of-input must report metadata once, deliver every decoded byte,
/// finish the sink and surface an overall pipeline-stop event.
#[test]
fn test_end_to_end_mp3_playback() {
    let frames = 25;
    let mut stream = id3_tag(300);
    for i in 0..frames {
        stream.extend(mp3_frame(i as u8));
    }

    let (pipeline, pcm) = mp3_pipeline(stream);
    pipeline.run().unwrap();

    pipeline
        .element("sink")
        .unwrap()
        .wait_for_state(
            |s| s == ElementState::Finished,
            Some(Duration::from_secs(10)),
        )
        .unwrap();

    assert_eq!(pcm.lock().unwrap().len(), frames * PCM_PER_FRAME);

    pipeline.stop();
    pipeline.wait_for_stop(Duration::from_secs(5)).unwrap();

    let mut stream_infos = 0;
    let mut sink_finished = false;
    let mut pipeline_stopped = false;
    while let Some(msg) = pipeline.try_recv_event() {
        match msg.event {
            ElementEvent::StreamInfo(info) => {
                assert_eq!(msg.source, "mp3");
                assert_eq!(info.sample_rate, 44100);
                assert_eq!(info.channels, 2);
                stream_infos += 1;
            }
            ElementEvent::StateChanged(ElementState::Finished) if msg.source == "sink" => {
                sink_finished = true;
            }
            ElementEvent::PipelineState(PipelineState::Stopped) => {
                pipeline_stopped = true;
            }
            _ => {}
        }
    }
    assert_eq!(stream_infos, 1, "metadata reported exactly once per change");
    assert!(sink_finished, "sink reached Finished");
    assert!(pipeline_stopped, "overall pipeline-stop event propagated");

    pipeline.terminate();
}

/// One corrupted frame between two valid ones: both valid frames decode
/// and nothing reports a fatal failure.
#[test]
fn test_end_to_end_resync_on_corrupt_frame() {
    let mut stream = mp3_frame(0x11);
    stream.extend(std::iter::repeat(0x21).take(FRAME_LEN)); // corrupted frame
    stream.extend(mp3_frame(0x33));

    let (pipeline, pcm) = mp3_pipeline(stream);
    pipeline.run().unwrap();

    pipeline
        .element("sink")
        .unwrap()
        .wait_for_state(
            |s| s == ElementState::Finished,
            Some(Duration::from_secs(10)),
        )
        .unwrap();

    assert_eq!(pcm.lock().unwrap().len(), 2 * PCM_PER_FRAME);
    assert_ne!(pipeline.state(), PipelineState::Error);
    assert_eq!(
        pipeline.element("mp3").unwrap().state(),
        ElementState::Finished
    );
    pipeline.terminate();
}

/// Stopping a deep pipeline is bounded per element, not compounding.
#[test]
fn test_bounded_stop_across_many_elements() {
    let pipeline = Pipeline::new("deep");
    let consumed = Arc::new(AtomicUsize::new(0));

    pipeline
        .register(Element::new("source", EndlessSource))
        .unwrap();
    for i in 0..4 {
        pipeline
            .register(Element::new(format!("pass-{}", i), Passthrough::new()))
            .unwrap();
    }
    pipeline
        .register(Element::new(
            "sink",
            CountingSink {
                consumed: consumed.clone(),
            },
        ))
        .unwrap();
    pipeline
        .link(&["source", "pass-0", "pass-1", "pass-2", "pass-3", "sink"])
        .unwrap();

    pipeline.run().unwrap();
    // Let data flow through the whole chain first.
    let deadline = Instant::now() + Duration::from_secs(5);
    while consumed.load(Ordering::Relaxed) < 4096 {
        assert!(Instant::now() < deadline, "pipeline never flowed");
        std::thread::sleep(Duration::from_millis(5));
    }

    let timeout = Duration::from_secs(2);
    let started = Instant::now();
    pipeline.stop();
    pipeline.wait_for_stop(timeout).unwrap();
    let elapsed = started.elapsed();

    // Six elements, each guaranteed to notice the stop promptly (aborted
    // ports): the total wait stays in the order of one timeout, far from
    // six stacked ones.
    assert!(
        elapsed < timeout * 2,
        "stop took {:?} for 6 elements",
        elapsed
    );
    pipeline.terminate();
}

/// FIFO order is preserved across an auto-created frame-port edge.
#[test]
fn test_frame_port_edge_preserves_order() {
    let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let store = SharedSink::default();
    let out = store.0.clone();

    let pipeline = Pipeline::new("framed");
    pipeline
        .register(Element::new(
            "source",
            ReaderSource::new(Cursor::new(data.clone()))
                .with_chunk_size(300)
                .with_output_spec(PortSpec::Frame(PoolConfig {
                    node_count: 3,
                    node_size: 512,
                    info_size: 0,
                })),
        ))
        .unwrap();
    pipeline
        .register(Element::new("sink", WriterSink::new(store)))
        .unwrap();
    pipeline.link(&["source", "sink"]).unwrap();
    pipeline.run().unwrap();

    pipeline
        .element("sink")
        .unwrap()
        .wait_for_state(
            |s| s == ElementState::Finished,
            Some(Duration::from_secs(10)),
        )
        .unwrap();

    assert_eq!(*out.lock().unwrap(), data);
    pipeline.terminate();
}

/// Pause freezes the flow; resume restores it; restart after stop replays
/// the lifecycle on the same wiring.
#[test]
fn test_pause_resume_stop_restart() {
    let pipeline = Pipeline::new("lifecycle");
    let consumed = Arc::new(AtomicUsize::new(0));
    pipeline
        .register(Element::new("source", EndlessSource))
        .unwrap();
    pipeline
        .register(Element::new(
            "sink",
            CountingSink {
                consumed: consumed.clone(),
            },
        ))
        .unwrap();
    pipeline.link(&["source", "sink"]).unwrap();

    pipeline.run().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while consumed.load(Ordering::Relaxed) == 0 {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(5));
    }

    pipeline.pause();
    // Pause is cooperative: the sink always reaches its next suspension
    // point (its reads are bounded), while a producer blocked on a full
    // ring may legitimately stay Running until data moves again. Wait on
    // the sink, then check that the flow is frozen.
    pipeline
        .element("sink")
        .unwrap()
        .wait_for_state(|s| s == ElementState::Paused, Some(Duration::from_secs(5)))
        .unwrap();
    let frozen = consumed.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(consumed.load(Ordering::Relaxed), frozen, "flow not frozen");

    pipeline.resume();
    let resumed_at = consumed.load(Ordering::Relaxed);
    let deadline = Instant::now() + Duration::from_secs(5);
    while consumed.load(Ordering::Relaxed) <= resumed_at + 4096 {
        assert!(Instant::now() < deadline, "flow did not resume");
        std::thread::sleep(Duration::from_millis(5));
    }

    pipeline.stop();
    pipeline.wait_for_stop(Duration::from_secs(5)).unwrap();

    let before_restart = consumed.load(Ordering::Relaxed);
    pipeline.run().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while consumed.load(Ordering::Relaxed) <= before_restart {
        assert!(Instant::now() < deadline, "restart did not flow");
        std::thread::sleep(Duration::from_millis(5));
    }

    pipeline.stop();
    pipeline.wait_for_stop(Duration::from_secs(5)).unwrap();
    pipeline.terminate();
}

/// A callback port stands in for a hardware FIFO at the physical edge of
/// the graph: the sink element's output is an externally-owned callback
/// port, and the element pipeline drives it directly.
#[test]
fn test_callback_port_at_pipeline_edge() {
    use cascade::port::{CallbackPort, Port};

    let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let fifo = Arc::new(Mutex::new(Vec::new()));
    let fifo_store = fifo.clone();

    let pipeline = Pipeline::new("edge");
    pipeline
        .register(Element::new(
            "source",
            ReaderSource::new(Cursor::new(data.clone())),
        ))
        .unwrap();
    pipeline
        .register(Element::new("pass", Passthrough::new()))
        .unwrap();
    pipeline.link(&["source", "pass"]).unwrap();

    // The "hardware" edge: a write callback accepting everything.
    let hw = CallbackPort::writer(move |src| {
        fifo_store.lock().unwrap().extend_from_slice(src);
        Ok(src.len())
    });
    pipeline
        .element("pass")
        .unwrap()
        .set_external_output(Port::callback("pass->hw", hw));

    pipeline.run().unwrap();
    pipeline
        .element("pass")
        .unwrap()
        .wait_for_state(
            |s| s == ElementState::Finished,
            Some(Duration::from_secs(10)),
        )
        .unwrap();

    assert_eq!(*fifo.lock().unwrap(), data);
    pipeline.terminate();

    // Unlink releases the auto-created ring but leaves the externally
    // owned callback port in place.
    pipeline.unlink();
    assert!(pipeline.element("pass").unwrap().output_port().is_some());
    assert!(pipeline.element("source").unwrap().output_port().is_none());
}

/// Tearing down and re-wiring a topology reuses the registered elements.
#[test]
fn test_unlink_relink_topology() {
    let data: Vec<u8> = vec![7u8; 2048];
    let store = SharedSink::default();
    let out = store.0.clone();

    let pipeline = Pipeline::new("rewire");
    pipeline
        .register(Element::new(
            "source",
            ReaderSource::new(Cursor::new(data.clone())),
        ))
        .unwrap();
    pipeline
        .register(Element::new("pass", Passthrough::new()))
        .unwrap();
    pipeline
        .register(Element::new("sink", WriterSink::new(store)))
        .unwrap();

    // First topology routes through the passthrough, then gets torn down
    // before ever running.
    pipeline.link(&["source", "pass", "sink"]).unwrap();
    pipeline.unlink();
    pipeline.unlink(); // idempotent

    // Second topology connects source directly to sink.
    pipeline.link(&["source", "sink"]).unwrap();
    pipeline.run().unwrap();
    pipeline
        .element("sink")
        .unwrap()
        .wait_for_state(
            |s| s == ElementState::Finished,
            Some(Duration::from_secs(10)),
        )
        .unwrap();

    assert_eq!(*out.lock().unwrap(), data);
    pipeline.terminate();
}
