//! Fingerprint records and the pair hash.
//!
//! A fingerprint joins two peaks. Its hash packs the time-independent shape
//! of the pair so the same acoustic event hashes identically wherever it
//! occurs in a recording:
//!
//! | bits   | field                                    |
//! |--------|------------------------------------------|
//! | 0..6   | `t2 - t1` in frames                      |
//! | 6      | `f1 > f2`                                |
//! | 7..17  | `abs(f1 - f2)` in eighth bins            |
//! | 17..29 | `f1` in eighth bins                      |
//! | 29     | second peak louder (optional energy bit) |

pub mod hasher;

pub use hasher::Hasher;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::spectral::Peak;

/// Largest `t2 - t1` the hash can represent.
pub const MAX_TIME_DELTA: u32 = (1 << TIME_BITS) - 1;

const TIME_BITS: u32 = 6;
const TIME_MASK: u32 = (1 << TIME_BITS) - 1;
const FREQ_MASK: u32 = (1 << 12) - 1;
const FREQ_DELTA_MASK: u32 = (1 << 10) - 1;

/// Highest peak bin whose interpolated position fits the `f1` field.
/// Interpolation moves a peak by at most half a bin.
pub const MAX_FREQ_BIN: u32 = FREQ_MASK / 8;

/// Largest peak distance in bins that fits the `abs(f1 - f2)` field, leaving
/// room for one bin of interpolation between the two peaks.
pub const MAX_FREQ_DISTANCE: u16 = (FREQ_DELTA_MASK / 8 - 1) as u16;

/// Flag bit: the second peak of the pair is louder than the first.
pub const FLAG_SECOND_LOUDER: u8 = 1;

/// Size of the little-endian wire record.
pub const RECORD_LEN: usize = 17;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint {
    pub t1: u32,
    pub f1: u16,
    pub t2: u32,
    pub f2: u16,
    pub hash: u32,
    pub flags: u8,
}

impl Fingerprint {
    pub fn from_peaks(p1: &Peak, p2: &Peak, energy_bit: bool) -> Self {
        let flags = if p2.magnitude > p1.magnitude { FLAG_SECOND_LOUDER } else { 0 };
        Self {
            t1: p1.frame_index,
            f1: p1.bin,
            t2: p2.frame_index,
            f2: p2.bin,
            hash: pair_hash(p1, p2, energy_bit),
            flags,
        }
    }

    pub fn time_delta(&self) -> u32 {
        self.t2 - self.t1
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..4].copy_from_slice(&self.t1.to_le_bytes());
        out[4..6].copy_from_slice(&self.f1.to_le_bytes());
        out[6..10].copy_from_slice(&self.t2.to_le_bytes());
        out[10..12].copy_from_slice(&self.f2.to_le_bytes());
        out[12..16].copy_from_slice(&self.hash.to_le_bytes());
        out[16] = self.flags;
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_LEN {
            return Err(Error::format(
                "fingerprint record",
                format!("expected {} bytes, got {}", RECORD_LEN, bytes.len()),
            ));
        }
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);

        let fingerprint = Self {
            t1: u32_at(0),
            f1: u16_at(4),
            t2: u32_at(6),
            f2: u16_at(10),
            hash: u32_at(12),
            flags: bytes[16],
        };
        if fingerprint.t2 <= fingerprint.t1 {
            return Err(Error::format(
                "fingerprint record",
                format!("t2 {} not after t1 {}", fingerprint.t2, fingerprint.t1),
            ));
        }
        Ok(fingerprint)
    }
}

/// Hash of a peak pair; see the module docs for the layout.
pub fn pair_hash(p1: &Peak, p2: &Peak, energy_bit: bool) -> u32 {
    let dt = (p2.frame_index - p1.frame_index) & TIME_MASK;
    let f1 = ((p1.fractional_bin * 8.0).round() as u32) & FREQ_MASK;
    let df = (((p1.fractional_bin - p2.fractional_bin) * 8.0).abs().round() as u32) & FREQ_DELTA_MASK;
    let f1_larger = u32::from(p1.bin > p2.bin);
    let louder = u32::from(energy_bit && p2.magnitude > p1.magnitude);

    (louder << 29) | (f1 << 17) | (df << 7) | (f1_larger << 6) | dt
}

/// Rewrite the time delta field of a hash.
pub fn with_time_delta(hash: u32, dt: u32) -> u32 {
    (hash & !TIME_MASK) | (dt & TIME_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peak(frame_index: u32, bin: u16, magnitude: f32) -> Peak {
        Peak {
            frame_index,
            bin,
            magnitude,
            fractional_bin: bin as f32,
        }
    }

    #[test]
    fn hash_ignores_absolute_time() {
        let a = pair_hash(&peak(10, 40, 1.0), &peak(17, 52, 0.5), false);
        let b = pair_hash(&peak(9010, 40, 0.3), &peak(9017, 52, 0.9), false);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_layout_is_stable() {
        let h = pair_hash(&peak(0, 40, 1.0), &peak(7, 52, 2.0), true);
        let expected = (1 << 29) | ((40 * 8) << 17) | ((12 * 8) << 7) | 7;
        assert_eq!(h, expected);

        let down = pair_hash(&peak(0, 52, 1.0), &peak(7, 40, 0.5), true);
        assert_eq!(down & (1 << 6), 1 << 6);
        assert_eq!(down & (1 << 29), 0);
    }

    #[test]
    fn widest_pairs_stay_in_their_fields() {
        let high = Peak {
            fractional_bin: MAX_FREQ_BIN as f32 + 0.5,
            ..peak(0, MAX_FREQ_BIN as u16, 1.0)
        };
        let low_bin = MAX_FREQ_BIN as u16 - MAX_FREQ_DISTANCE;
        let low = Peak {
            fractional_bin: low_bin as f32 - 0.5,
            ..peak(MAX_TIME_DELTA, low_bin, 2.0)
        };

        let hash = pair_hash(&high, &low, false);
        assert_eq!(hash >> 29, 0);
        assert_eq!((hash >> 17) & FREQ_MASK, MAX_FREQ_BIN * 8 + 4);
        assert_eq!((hash >> 7) & FREQ_DELTA_MASK, (u32::from(MAX_FREQ_DISTANCE) + 1) * 8);
        assert_eq!(hash & TIME_MASK, MAX_TIME_DELTA);
    }

    #[test]
    fn rewrites_time_delta() {
        let h = pair_hash(&peak(0, 40, 1.0), &peak(7, 52, 2.0), false);
        assert_eq!(with_time_delta(h, 8) & TIME_MASK, 8);
        assert_eq!(with_time_delta(h, 8) & !TIME_MASK, h & !TIME_MASK);
        assert_eq!(with_time_delta(with_time_delta(h, 6), 7), h);
    }

    #[test]
    fn wire_record() {
        let fp = Fingerprint::from_peaks(&peak(100, 20, 0.4), &peak(130, 61, 0.9), false);
        assert_eq!(fp.flags, FLAG_SECOND_LOUDER);
        let bytes = fp.to_bytes();
        assert_eq!(&bytes[0..4], &100u32.to_le_bytes());
        assert_eq!(Fingerprint::from_bytes(&bytes).unwrap(), fp);

        assert!(Fingerprint::from_bytes(&bytes[..16]).is_err());
        let mut backwards = bytes;
        backwards[6..10].copy_from_slice(&50u32.to_le_bytes());
        assert!(Fingerprint::from_bytes(&backwards).is_err());
    }
}
