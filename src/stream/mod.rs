//! Block-wise fingerprint extraction from sample streams.

pub mod runner;

pub use runner::{MonitorReports, RunnerState, StoreOutcome, StreamRunner, WindowReport};

use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::AudioData;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fingerprint::{Fingerprint, Hasher};
use crate::spectral::{FrameProducer, PeakPicker};

/// Shared flag that asks a running stream to stop at the next frame.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Frame producer, peak picker and hasher chained together.
pub struct Extractor {
    frames: FrameProducer,
    peaks: PeakPicker,
    hasher: Hasher,
    samples: u64,
}

impl Extractor {
    pub fn new(config: &Config) -> Self {
        let frames = FrameProducer::new(&config.audio);
        let peaks = PeakPicker::new(&config.peaks, frames.bins());
        Self {
            frames,
            peaks,
            hasher: Hasher::new(&config.fingerprint),
            samples: 0,
        }
    }

    /// Feed samples, appending every fingerprint that became final.
    pub fn push(&mut self, samples: &[f32], out: &mut Vec<Fingerprint>) {
        self.samples += samples.len() as u64;
        for frame in self.frames.push(samples) {
            if let Some((centre, peaks)) = self.peaks.push(frame) {
                self.hasher.push(centre, &peaks, out);
            }
        }
    }

    /// End of input: flush the anchors still waiting for partners.
    pub fn finish(&mut self, out: &mut Vec<Fingerprint>) {
        self.hasher.finish(out);
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Extract a whole in-memory recording at once.
    pub fn extract_all(config: &Config, samples: &[f32]) -> Vec<Fingerprint> {
        let mut extractor = Self::new(config);
        let mut out = Vec::new();
        extractor.push(samples, &mut out);
        extractor.finish(&mut out);
        out
    }
}

/// Where a stream gets its samples from.
pub trait SampleSource {
    /// Fill `buf` from the front, returning how many samples were written.
    /// Zero means the source is exhausted.
    fn read_samples(&mut self, buf: &mut [f32]) -> Result<usize>;

    fn sample_rate(&self) -> u32;
}

/// Samples already in memory.
pub struct MemorySource {
    samples: Vec<f32>,
    position: usize,
    sample_rate: u32,
}

impl MemorySource {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            position: 0,
            sample_rate,
        }
    }
}

impl From<AudioData> for MemorySource {
    fn from(audio: AudioData) -> Self {
        Self::new(audio.samples, audio.sample_rate)
    }
}

impl SampleSource for MemorySource {
    fn read_samples(&mut self, buf: &mut [f32]) -> Result<usize> {
        let n = buf.len().min(self.samples.len() - self.position);
        buf[..n].copy_from_slice(&self.samples[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Little-endian `f32` samples from any reader, e.g. stdin fed by a recorder.
pub struct RawF32Source<R> {
    reader: R,
    sample_rate: u32,
    bytes: Vec<u8>,
}

impl<R: Read> RawF32Source<R> {
    pub fn new(reader: R, sample_rate: u32) -> Self {
        Self {
            reader,
            sample_rate,
            bytes: Vec::new(),
        }
    }
}

impl<R: Read> SampleSource for RawF32Source<R> {
    fn read_samples(&mut self, buf: &mut [f32]) -> Result<usize> {
        let want = buf.len() * 4;
        self.bytes.resize(want, 0);

        // blocks until a full buffer or end of input, so live input advances
        // one hop at a time
        let mut filled = 0;
        while filled < want {
            match self.reader.read(&mut self.bytes[filled..want]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Input(format!("reading samples: {}", e))),
            }
        }
        if filled % 4 != 0 {
            log::warn!("dropping {} trailing bytes of a partial sample", filled % 4);
        }

        let n = filled / 4;
        for (sample, b) in buf.iter_mut().zip(self.bytes[..n * 4].chunks_exact(4)) {
            *sample = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        }
        Ok(n)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Lazily extracted fingerprints of one source, in non-decreasing `t1`
/// order. Single pass; ends early when cancelled.
pub struct FingerprintStream<S> {
    source: S,
    extractor: Extractor,
    cancel: CancelToken,
    buf: Vec<f32>,
    pending: VecDeque<Fingerprint>,
    scratch: Vec<Fingerprint>,
    finished: bool,
    cancelled: bool,
}

impl<S: SampleSource> FingerprintStream<S> {
    pub fn new(source: S, config: &Config, cancel: CancelToken) -> Result<Self> {
        if source.sample_rate() != config.audio.sample_rate {
            return Err(Error::Input(format!(
                "sample rate {} Hz, expected {} Hz",
                source.sample_rate(),
                config.audio.sample_rate
            )));
        }
        Ok(Self {
            source,
            extractor: Extractor::new(config),
            cancel,
            buf: vec![0.0; config.audio.step_size],
            pending: VecDeque::new(),
            scratch: Vec::new(),
            finished: false,
            cancelled: false,
        })
    }

    /// Samples consumed so far.
    pub fn samples(&self) -> u64 {
        self.extractor.samples()
    }

    pub fn seconds(&self) -> f64 {
        self.samples() as f64 / self.source.sample_rate() as f64
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    // Reads one hop of samples; at most one new frame per call.
    fn advance(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            log::info!("stream cancelled after {:.2}s", self.seconds());
            self.cancelled = true;
            self.finished = true;
            return Ok(());
        }

        let n = self.source.read_samples(&mut self.buf)?;
        if n == 0 {
            self.finished = true;
            if self.extractor.samples() == 0 {
                return Err(Error::Input("no audio samples".into()));
            }
            self.extractor.finish(&mut self.scratch);
        } else {
            self.extractor.push(&self.buf[..n], &mut self.scratch);
        }
        self.pending.extend(self.scratch.drain(..));
        Ok(())
    }
}

impl<S: SampleSource> Iterator for FingerprintStream<S> {
    type Item = Result<Fingerprint>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(fingerprint) = self.pending.pop_front() {
                return Some(Ok(fingerprint));
            }
            if self.finished {
                return None;
            }
            if let Err(e) = self.advance() {
                self.finished = true;
                return Some(Err(e));
            }
        }
    }
}
