use std::io::Read;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::{Error, Result};

/// Extension of headerless little-endian `f32` mono files.
pub const RAW_EXTENSION: &str = "raw";

/// Decoded mono audio.
#[derive(Clone, Debug, Default)]
pub struct AudioData {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioData {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Load `path` as mono samples at `sample_rate`.
///
/// `.raw` files are read as little-endian `f32` at the expected rate; anything
/// else goes through symphonia. Audio at another rate is rejected, it is
/// never resampled.
pub fn load_audio(path: &Path, sample_rate: u32) -> Result<AudioData> {
    let is_raw = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(RAW_EXTENSION));

    let audio = if is_raw {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Input(format!("{}: {}", path.display(), e)))?;
        AudioData {
            samples: read_raw_f32(std::io::BufReader::new(file))?,
            sample_rate,
        }
    } else {
        decode_audio(path)?
    };

    if audio.sample_rate != sample_rate {
        return Err(Error::Input(format!(
            "{}: sample rate {} Hz, expected {} Hz (resample first)",
            path.display(),
            audio.sample_rate,
            sample_rate
        )));
    }
    if audio.samples.is_empty() {
        return Err(Error::Input(format!("{}: no audio samples", path.display())));
    }
    Ok(audio)
}

pub fn decode_audio(path: &Path) -> Result<AudioData> {
    let input = |msg: String| Error::Input(format!("{}: {}", path.display(), msg));

    let file = std::fs::File::open(path).map_err(|e| input(e.to_string()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| input(format!("unsupported format: {}", e)))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| input("no audio tracks found".into()))?;

    let track_id = track.id;
    let channels = track.codec_params.channels.map_or(1, |c| c.count()).max(1);
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| input("unknown sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| input(format!("no decoder: {}", e)))?;

    let mut all_samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(input(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                log::debug!("{}: skipping undecodable packet: {}", path.display(), e);
                continue;
            }
            Err(e) => return Err(input(e.to_string())),
        };

        let spec = *decoded.spec();
        let num_frames = decoded.frames();

        let mut sample_buf = SampleBuffer::<f32>::new(num_frames as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        let samples = sample_buf.samples();

        // Downmix to mono
        if channels == 1 {
            all_samples.extend_from_slice(samples);
        } else {
            for frame_samples in samples.chunks(channels) {
                let mono: f32 = frame_samples.iter().sum::<f32>() / channels as f32;
                all_samples.push(mono);
            }
        }
    }

    log::debug!(
        "decoded {}: {} samples, {}Hz, {:.1}s",
        path.display(),
        all_samples.len(),
        sample_rate,
        all_samples.len() as f32 / sample_rate as f32
    );

    Ok(AudioData {
        samples: all_samples,
        sample_rate,
    })
}

/// Read every little-endian `f32` from `reader`. A trailing partial sample
/// is dropped.
pub fn read_raw_f32<R: Read>(mut reader: R) -> Result<Vec<f32>> {
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|e| Error::Input(format!("reading raw samples: {}", e)))?;
    if bytes.len() % 4 != 0 {
        log::warn!("dropping {} trailing bytes of a partial sample", bytes.len() % 4);
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_bytes(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn raw_files_load_at_the_expected_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.raw");
        std::fs::write(&path, raw_bytes(&[0.25, -0.5, 1.0])).unwrap();

        let audio = load_audio(&path, 8000).unwrap();
        assert_eq!(audio.samples, vec![0.25, -0.5, 1.0]);
        assert_eq!(audio.sample_rate, 8000);
    }

    #[test]
    fn partial_sample_is_dropped() {
        let mut bytes = raw_bytes(&[0.5, 0.75]);
        bytes.push(1);
        assert_eq!(read_raw_f32(bytes.as_slice()).unwrap(), vec![0.5, 0.75]);
    }

    #[test]
    fn empty_and_missing_inputs_are_input_errors() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.raw");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(load_audio(&empty, 8000), Err(Error::Input(_))));

        let missing = dir.path().join("missing.mp3");
        assert!(matches!(load_audio(&missing, 8000), Err(Error::Input(_))));

        let junk = dir.path().join("junk.wav");
        std::fs::write(&junk, b"definitely not audio").unwrap();
        assert!(matches!(load_audio(&junk, 8000), Err(Error::Input(_))));
    }
}
