pub mod decode;

pub use decode::{load_audio, read_raw_f32, AudioData};
