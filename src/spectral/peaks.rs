use std::collections::VecDeque;

use super::frame::SpectralFrame;
use crate::config::PeakConfig;

/// A locally maximal, above-noise-floor time-frequency bin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Peak {
    pub frame_index: u32,
    pub bin: u16,
    pub magnitude: f32,
    /// Bin position refined by quadratic interpolation of log magnitudes.
    pub fractional_bin: f32,
}

/// Picks peaks from a sliding window of the last `time_filter_size` frames.
///
/// A bin of the centre frame is a peak when it is the maximum of its
/// time x frequency neighborhood, beats the per-bin noise floor by
/// `min_contrast`, and no equal neighbour takes precedence (lower bin first,
/// then earlier frame). Peaks come out in frame order, bins ascending.
pub struct PeakPicker {
    config: PeakConfig,
    bins: usize,
    frames: VecDeque<SpectralFrame>,
    // frequency max filtered copy of each frame in `frames`
    freq_maxes: VecDeque<Vec<f32>>,
    noise_floor: Vec<f32>,
}

impl PeakPicker {
    pub fn new(config: &PeakConfig, bins: usize) -> Self {
        Self {
            config: config.clone(),
            bins,
            frames: VecDeque::with_capacity(config.time_filter_size),
            freq_maxes: VecDeque::with_capacity(config.time_filter_size),
            noise_floor: vec![0.0; bins],
        }
    }

    /// Feed the next frame, returning the peaks confirmed for the centre frame.
    ///
    /// Returns the index of the centre frame alongside its peaks, or `None`
    /// while the window is still filling.
    pub fn push(&mut self, frame: SpectralFrame) -> Option<(u32, Vec<Peak>)> {
        debug_assert_eq!(frame.magnitudes.len(), self.bins);

        let decay = self.config.noise_floor_decay;
        for (floor, &m) in self.noise_floor.iter_mut().zip(frame.magnitudes.iter()) {
            *floor = decay * *floor + (1.0 - decay) * m;
        }

        let half_freq = self.config.freq_filter_size / 2;
        self.freq_maxes.push_back(max_filter(&frame.magnitudes, half_freq));
        self.frames.push_back(frame);
        if self.frames.len() > self.config.time_filter_size {
            self.frames.pop_front();
            self.freq_maxes.pop_front();
        }
        if self.frames.len() < self.config.time_filter_size {
            return None;
        }

        let center = self.config.time_filter_size / 2;
        let peaks = self.pick(center);
        Some((self.frames[center].index, peaks))
    }

    fn pick(&self, center: usize) -> Vec<Peak> {
        let frame = &self.frames[center];
        let mut candidates: Vec<Peak> = Vec::new();

        // DC and Nyquist are never peaks
        for bin in 1..self.bins - 1 {
            let magnitude = frame.magnitudes[bin];
            if magnitude <= self.config.min_magnitude {
                continue;
            }

            let neighborhood_max = self
                .freq_maxes
                .iter()
                .map(|maxes| maxes[bin])
                .fold(f32::MIN, f32::max);
            if magnitude < neighborhood_max {
                continue;
            }

            if magnitude <= self.noise_floor[bin] * self.config.min_contrast {
                continue;
            }

            if self.loses_tie(center, bin, magnitude) {
                continue;
            }

            candidates.push(Peak {
                frame_index: frame.index,
                bin: bin as u16,
                magnitude,
                fractional_bin: interpolate(&frame.magnitudes, bin),
            });
        }

        if candidates.len() > self.config.max_peaks_per_frame {
            candidates.sort_by(|a, b| {
                b.magnitude
                    .total_cmp(&a.magnitude)
                    .then(a.bin.cmp(&b.bin))
            });
            candidates.truncate(self.config.max_peaks_per_frame);
            candidates.sort_by_key(|p| p.bin);
        }
        candidates
    }

    // An equal neighbour at a lower bin, or at the same bin in an earlier
    // frame, owns the peak.
    fn loses_tie(&self, center: usize, bin: usize, magnitude: f32) -> bool {
        let half_freq = self.config.freq_filter_size / 2;
        let lo = bin.saturating_sub(half_freq);
        let hi = (bin + half_freq).min(self.bins - 1);

        for (t, frame) in self.frames.iter().enumerate() {
            for b in lo..=hi {
                if (t, b) == (center, bin) || frame.magnitudes[b] != magnitude {
                    continue;
                }
                if b < bin || (b == bin && t < center) {
                    return true;
                }
            }
        }
        false
    }
}

fn max_filter(data: &[f32], half: usize) -> Vec<f32> {
    (0..data.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(data.len());
            data[lo..hi].iter().copied().fold(f32::MIN, f32::max)
        })
        .collect()
}

fn interpolate(magnitudes: &[f32], bin: usize) -> f32 {
    let (a, b, c) = (magnitudes[bin - 1], magnitudes[bin], magnitudes[bin + 1]);
    if a <= 0.0 || c <= 0.0 {
        return bin as f32;
    }
    let (la, lb, lc) = (a.ln(), b.ln(), c.ln());
    let denominator = la - 2.0 * lb + lc;
    if denominator.abs() < f32::EPSILON {
        return bin as f32;
    }
    let offset = (0.5 * (la - lc) / denominator).clamp(-0.5, 0.5);
    if offset.is_finite() {
        bin as f32 + offset
    } else {
        bin as f32
    }
}
