use std::collections::VecDeque;

use super::Fingerprint;
use crate::config::FingerprintConfig;
use crate::spectral::Peak;

/// Pairs peaks into fingerprints.
///
/// Peaks are held until no later peak can pair with them any more, so the
/// output leaves in non-decreasing `t1` order even though pairs are only
/// known once their second peak has arrived.
pub struct Hasher {
    config: FingerprintConfig,
    pending: VecDeque<Peak>,
    recent: VecDeque<u32>,
}

impl Hasher {
    pub fn new(config: &FingerprintConfig) -> Self {
        Self {
            config: config.clone(),
            pending: VecDeque::new(),
            recent: VecDeque::with_capacity(config.recent_hashes),
        }
    }

    /// Add the peaks confirmed up to `current_frame` and emit every anchor that
    /// can no longer gain partners.
    pub fn push(&mut self, current_frame: u32, peaks: &[Peak], out: &mut Vec<Fingerprint>) {
        self.pending.extend(peaks.iter().copied().filter(|p| p.bin != 0));

        while let Some(anchor) = self.pending.front() {
            if anchor.frame_index + self.config.max_time_distance > current_frame {
                break;
            }
            if let Some(anchor) = self.pending.pop_front() {
                self.emit_pairs(&anchor, out);
            }
        }
    }

    /// Flush every remaining anchor at end of stream.
    pub fn finish(&mut self, out: &mut Vec<Fingerprint>) {
        while let Some(anchor) = self.pending.pop_front() {
            self.emit_pairs(&anchor, out);
        }
        self.recent.clear();
    }

    fn emit_pairs(&mut self, anchor: &Peak, out: &mut Vec<Fingerprint>) {
        let cfg = &self.config;
        let horizon = anchor.frame_index + cfg.max_time_distance;

        let mut partners: Vec<Peak> = self
            .pending
            .iter()
            .take_while(|p| p.frame_index <= horizon)
            .filter(|p| {
                let dt = p.frame_index - anchor.frame_index;
                let df = p.bin.abs_diff(anchor.bin);
                dt >= cfg.min_time_distance
                    && df >= cfg.min_freq_distance
                    && df <= cfg.max_freq_distance
            })
            .copied()
            .collect();

        partners.sort_by(|a, b| {
            b.magnitude
                .total_cmp(&a.magnitude)
                .then(a.frame_index.cmp(&b.frame_index))
                .then(a.bin.cmp(&b.bin))
        });
        partners.truncate(cfg.fan_out);
        partners.sort_by_key(|p| (p.frame_index, p.bin));

        for partner in &partners {
            let fingerprint = Fingerprint::from_peaks(anchor, partner, self.config.energy_bit);
            if self.is_recent(fingerprint.hash) {
                continue;
            }
            out.push(fingerprint);
        }
    }

    // Records the hash and reports whether it was already among the recent ones.
    fn is_recent(&mut self, hash: u32) -> bool {
        let limit = self.config.recent_hashes;
        if limit == 0 {
            return false;
        }
        if self.recent.contains(&hash) {
            return true;
        }
        if self.recent.len() == limit {
            self.recent.pop_front();
        }
        self.recent.push_back(hash);
        false
    }
}
