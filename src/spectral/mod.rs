//! Spectral analysis: magnitude frames and peak picking.

pub mod frame;
pub mod peaks;

pub use frame::{FrameProducer, SpectralFrame};
pub use peaks::{Peak, PeakPicker};
