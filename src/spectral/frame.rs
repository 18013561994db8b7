use std::collections::VecDeque;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::config::AudioConfig;

/// One magnitude spectrum. Bins run from DC to Nyquist inclusive.
#[derive(Clone, Debug)]
pub struct SpectralFrame {
    pub index: u32,
    pub magnitudes: Vec<f32>,
}

/// Turns an incrementally fed sample stream into magnitude frames, one per hop.
///
/// Only `block_size` samples of history are kept. Samples left over at the end
/// of a stream that never fill a block are dropped rather than zero padded.
pub struct FrameProducer {
    block_size: usize,
    step_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    pending: VecDeque<f32>,
    scratch: Vec<Complex<f32>>,
    next_index: u32,
}

impl FrameProducer {
    pub fn new(config: &AudioConfig) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(config.block_size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        Self {
            block_size: config.block_size,
            step_size: config.step_size,
            fft,
            window: hann_window(config.block_size),
            pending: VecDeque::with_capacity(config.block_size),
            scratch,
            next_index: 0,
        }
    }

    pub fn bins(&self) -> usize {
        self.block_size / 2 + 1
    }

    /// Index the next emitted frame will carry.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn push(&mut self, samples: &[f32]) -> Vec<SpectralFrame> {
        let mut frames = Vec::new();
        for &sample in samples {
            self.pending.push_back(sample);
            if self.pending.len() == self.block_size {
                frames.push(self.transform());
                self.pending.drain(..self.step_size);
            }
        }
        frames
    }

    fn transform(&mut self) -> SpectralFrame {
        let mut buffer: Vec<Complex<f32>> = self
            .pending
            .iter()
            .zip(self.window.iter())
            .map(|(&s, &w)| Complex::new(s * w, 0.0))
            .collect();
        self.fft.process_with_scratch(&mut buffer, &mut self.scratch);

        let magnitudes = buffer[..=self.block_size / 2]
            .iter()
            .map(|c| (c.re * c.re + c.im * c.im).sqrt())
            .collect();

        let index = self.next_index;
        self.next_index += 1;
        SpectralFrame { index, magnitudes }
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AudioConfig {
        AudioConfig {
            sample_rate: 8000,
            block_size: 512,
            step_size: 256,
        }
    }

    #[test]
    fn emits_one_frame_per_hop_and_drops_tail() {
        let mut producer = FrameProducer::new(&config());

        assert!(producer.push(&vec![0.0; 511]).is_empty());
        let frames = producer.push(&[0.0]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].index, 0);
        assert_eq!(frames[0].magnitudes.len(), 257);

        // 255 more samples are not enough for the next hop
        assert!(producer.push(&vec![0.0; 255]).is_empty());
        let frames = producer.push(&vec![0.0; 257]);
        assert_eq!(frames.iter().map(|f| f.index).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(producer.next_index(), 3);
    }

    #[test]
    fn frame_count_matches_stream_length() {
        let mut producer = FrameProducer::new(&config());
        let total: usize = (0..10)
            .map(|_| producer.push(&vec![0.1; 1000]).len())
            .sum();
        // (10_000 - 512) / 256 + 1
        assert_eq!(total, 38);
    }

    #[test]
    fn sine_peaks_at_its_bin() {
        let cfg = config();
        let mut producer = FrameProducer::new(&cfg);
        // bin 64 of a 512 point FFT at 8 kHz is 1000 Hz
        let samples: Vec<f32> = (0..2048)
            .map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 8000.0).sin() * 0.5)
            .collect();
        let frames = producer.push(&samples);
        assert!(!frames.is_empty());
        for frame in frames {
            let (bin, _) = frame
                .magnitudes
                .iter()
                .enumerate()
                .fold((0, 0.0f32), |best, (i, &m)| if m > best.1 { (i, m) } else { best });
            assert_eq!(bin, 64);
        }
    }

    #[test]
    fn silence_has_zero_magnitude() {
        let mut producer = FrameProducer::new(&config());
        let frames = producer.push(&vec![0.0; 512]);
        assert!(frames[0].magnitudes.iter().all(|&m| m == 0.0));
    }
}
