//! Acoustic echo cancellation element.
//!
//! The element owns the data-flow contract around the canceller: reference
//! signal acquisition in two modes, sample alignment, delay compensation
//! and output fan-out. The adaptive filter itself sits behind
//! [`EchoCanceller`]; a normalized-LMS implementation is built in.
//!
//! Input modes:
//!
//! - **Hardware**: one interleaved stereo input carries microphone and
//!   loudspeaker-reference in alternating samples (a codec chip loops the
//!   speaker feed back on the second channel); de-interleaved here.
//! - **Software**: the microphone arrives on the normal input port and the
//!   reference on multi-input 0, read independently and zero-filled when
//!   momentarily short, so the canceller always sees equal-length blocks.

use crate::element::{ProcCtx, Processor, Progress};
use crate::error::{Error, Result};
use crate::port::PortSpec;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// How the reference signal reaches the element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AecMode {
    /// Interleaved mic/reference on the main input.
    Hardware,
    /// Mic on the main input, reference on multi-input 0.
    Software,
}

/// Echo cancellation element configuration.
#[derive(Debug, Clone)]
pub struct AecConfig {
    /// Reference signal mode.
    pub mode: AecMode,
    /// Sample rate in Hz; 8000 or 16000.
    pub sample_rate: u32,
    /// Reference delay in samples (hardware loopback lead time).
    pub reference_delay: usize,
    /// Adaptive filter length in taps (echo cancellation depth).
    pub filter_length: usize,
    /// Noise suppression level, 0 disables.
    pub noise_suppression: u8,
    /// Output gain applied after cancellation.
    pub drc_gain: f32,
    /// The output port to auto-create when linked.
    pub out_spec: PortSpec,
}

impl Default for AecConfig {
    fn default() -> Self {
        Self {
            mode: AecMode::Software,
            sample_rate: 16000,
            reference_delay: 0,
            filter_length: 128,
            noise_suppression: 0,
            drc_gain: 1.0,
            out_spec: PortSpec::Ring { capacity: 8192 },
        }
    }
}

/// The adaptive filter seam. `mic`, `reference` and `out` are always the
/// same length.
pub trait EchoCanceller: Send + 'static {
    /// Cancel `reference` out of `mic` into `out`.
    fn process(&mut self, mic: &[i16], reference: &[i16], out: &mut [i16]);

    /// Drop adapted state.
    fn reset(&mut self) {}
}

/// Normalized LMS canceller with an optional downward expander standing in
/// for noise suppression.
pub struct NlmsCanceller {
    taps: Vec<f32>,
    history: Vec<f32>,
    mu: f32,
    eps: f32,
    noise_floor: f32,
}

impl NlmsCanceller {
    /// Create a canceller with `filter_length` taps.
    pub fn new(filter_length: usize, noise_suppression: u8) -> Self {
        Self {
            taps: vec![0.0; filter_length.max(1)],
            history: vec![0.0; filter_length.max(1)],
            mu: 0.5,
            eps: 1e-3,
            noise_floor: noise_suppression as f32 * 1e-3,
        }
    }
}

impl EchoCanceller for NlmsCanceller {
    fn process(&mut self, mic: &[i16], reference: &[i16], out: &mut [i16]) {
        for i in 0..mic.len() {
            self.history.rotate_right(1);
            self.history[0] = reference[i] as f32 / 32768.0;

            let mut estimate = 0.0f32;
            let mut energy = self.eps;
            for (tap, h) in self.taps.iter().zip(self.history.iter()) {
                estimate += tap * h;
                energy += h * h;
            }

            let desired = mic[i] as f32 / 32768.0;
            let residual = desired - estimate;
            let step = self.mu * residual / energy;
            for (tap, h) in self.taps.iter_mut().zip(self.history.iter()) {
                *tap += step * h;
            }

            let mut y = residual;
            if self.noise_floor > 0.0 && y.abs() < self.noise_floor {
                y *= 0.25;
            }
            out[i] = (y * 32768.0).clamp(-32768.0, 32767.0) as i16;
        }
    }

    fn reset(&mut self) {
        self.taps.fill(0.0);
        self.history.fill(0.0);
    }
}

/// The echo cancellation stage.
pub struct Aec {
    config: AecConfig,
    canceller: Box<dyn EchoCanceller>,
    /// Samples per processing block (10 ms).
    block: usize,
    /// Pending bytes from the main input.
    inbuf: Vec<u8>,
    /// Pending reference bytes (software mode).
    ref_pending: VecDeque<u8>,
    ref_scratch: Vec<u8>,
    /// Reference delay line, pre-loaded with `reference_delay` zeros.
    delay: VecDeque<i16>,
    mic: Vec<i16>,
    reference: Vec<i16>,
    out: Vec<i16>,
    out_bytes: Vec<u8>,
    eos: bool,
}

impl Aec {
    /// Create the stage with the built-in NLMS canceller.
    pub fn new(config: AecConfig) -> Result<Self> {
        let canceller = NlmsCanceller::new(config.filter_length, config.noise_suppression);
        Self::with_canceller(config, Box::new(canceller))
    }

    /// Create the stage with an explicit canceller.
    pub fn with_canceller(config: AecConfig, canceller: Box<dyn EchoCanceller>) -> Result<Self> {
        if !matches!(config.sample_rate, 8000 | 16000) {
            return Err(Error::InvalidConfig(format!(
                "AEC sample rate {} not supported (8000 or 16000)",
                config.sample_rate
            )));
        }
        if config.filter_length == 0 {
            return Err(Error::InvalidConfig("AEC filter length must be > 0".into()));
        }
        if config.drc_gain <= 0.0 {
            return Err(Error::InvalidConfig("AEC gain must be > 0".into()));
        }

        let block = (config.sample_rate / 100) as usize;
        Ok(Self {
            canceller,
            block,
            inbuf: Vec::with_capacity(block * 4),
            ref_pending: VecDeque::with_capacity(block * 8),
            ref_scratch: vec![0u8; block * 2],
            delay: VecDeque::new(),
            mic: vec![0i16; block],
            reference: vec![0i16; block],
            out: vec![0i16; block],
            out_bytes: vec![0u8; block * 2],
            eos: false,
            config,
        })
    }

    /// Bytes one processing block needs on the main input.
    fn need(&self) -> usize {
        match self.config.mode {
            AecMode::Hardware => self.block * 4, // interleaved stereo, 16 bit
            AecMode::Software => self.block * 2, // mono, 16 bit
        }
    }

    /// Drain whatever the reference port has right now, without blocking.
    fn pull_reference(&mut self, ctx: &mut ProcCtx) {
        if self.config.mode != AecMode::Software || ctx.multi_in_count() == 0 {
            return;
        }
        let want = (self.block * 2).min(self.ref_scratch.len());
        match ctx.try_read_multi(0, &mut self.ref_scratch[..want]) {
            Ok(n) => self.ref_pending.extend(&self.ref_scratch[..n]),
            Err(_) => {}
        }
        // Bound producer/consumer drift: a reference running far ahead is
        // stale and only mistrains the filter.
        let cap = self.block * 2 * 8;
        while self.ref_pending.len() > cap {
            self.ref_pending.pop_front();
        }
    }

    /// Split one block off `inbuf` into mic and (pre-delay) reference.
    fn split_block(&mut self) {
        let need = self.need();
        match self.config.mode {
            AecMode::Hardware => {
                for i in 0..self.block {
                    let base = i * 4;
                    self.mic[i] =
                        i16::from_le_bytes([self.inbuf[base], self.inbuf[base + 1]]);
                    self.reference[i] =
                        i16::from_le_bytes([self.inbuf[base + 2], self.inbuf[base + 3]]);
                }
            }
            AecMode::Software => {
                for i in 0..self.block {
                    let base = i * 2;
                    self.mic[i] =
                        i16::from_le_bytes([self.inbuf[base], self.inbuf[base + 1]]);
                }
                for i in 0..self.block {
                    // Zero-filled when the reference port is short.
                    self.reference[i] = match (self.ref_pending.pop_front(), self.ref_pending.pop_front())
                    {
                        (Some(lo), Some(hi)) => i16::from_le_bytes([lo, hi]),
                        _ => 0,
                    };
                }
            }
        }
        self.inbuf.drain(..need);
    }
}

impl Processor for Aec {
    fn open(&mut self, ctx: &mut ProcCtx) -> Result<()> {
        self.inbuf.clear();
        self.ref_pending.clear();
        self.eos = false;
        self.delay.clear();
        self.delay
            .extend(std::iter::repeat(0i16).take(self.config.reference_delay));
        self.canceller.reset();
        if self.config.mode == AecMode::Software && ctx.multi_in_count() == 0 {
            debug!(
                element = ctx.name(),
                "no reference port wired, cancelling against silence"
            );
        }
        Ok(())
    }

    fn process(&mut self, ctx: &mut ProcCtx) -> Result<Progress> {
        let need = self.need();

        if !self.eos && self.inbuf.len() < need {
            let old = self.inbuf.len();
            self.inbuf.resize(need, 0);
            match ctx.read(&mut self.inbuf[old..]) {
                Ok(0) => {
                    self.inbuf.truncate(old);
                    self.eos = true;
                }
                Ok(n) => self.inbuf.truncate(old + n),
                Err(e) => {
                    self.inbuf.truncate(old);
                    return Err(e);
                }
            }
        }
        self.pull_reference(ctx);

        if self.inbuf.len() < need {
            if self.eos {
                if !self.inbuf.is_empty() {
                    trace!(
                        element = ctx.name(),
                        dropped = self.inbuf.len(),
                        "partial trailing block dropped"
                    );
                }
                return Ok(Progress::Finished);
            }
            return Ok(Progress::Advanced);
        }

        self.split_block();

        // Route the reference through the configured delay line.
        for i in 0..self.block {
            self.delay.push_back(self.reference[i]);
        }
        for i in 0..self.block {
            self.reference[i] = self.delay.pop_front().unwrap_or(0);
        }

        self.canceller
            .process(&self.mic, &self.reference, &mut self.out);

        let gain = self.config.drc_gain;
        for (bytes, sample) in self.out_bytes.chunks_exact_mut(2).zip(self.out.iter()) {
            let scaled = (*sample as f32 * gain).clamp(-32768.0, 32767.0) as i16;
            bytes.copy_from_slice(&scaled.to_le_bytes());
        }

        ctx.write(&self.out_bytes)?;
        // Best-effort copies to the extra outputs; never stalls the
        // primary path.
        ctx.fan_out(&self.out_bytes);

        Ok(Progress::Advanced)
    }

    fn output_spec(&self) -> PortSpec {
        self.config.out_spec.clone()
    }
}
