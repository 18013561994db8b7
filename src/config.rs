use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fingerprint::{MAX_FREQ_BIN, MAX_FREQ_DISTANCE, MAX_TIME_DELTA};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub peaks: PeakConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    /// Sample rate the bin-to-frequency mapping assumes.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// FFT size in samples, a power of two.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Hop between consecutive frames in samples.
    #[serde(default = "default_step_size")]
    pub step_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeakConfig {
    /// Frames in the sliding time window (odd).
    #[serde(default = "default_filter_size")]
    pub time_filter_size: usize,
    /// Bins in the frequency neighborhood (odd).
    #[serde(default = "default_filter_size")]
    pub freq_filter_size: usize,
    #[serde(default = "default_min_magnitude")]
    pub min_magnitude: f32,
    /// Weight of the previous noise floor in the running average.
    #[serde(default = "default_noise_floor_decay")]
    pub noise_floor_decay: f32,
    /// A peak must exceed the noise floor by this factor.
    #[serde(default = "default_min_contrast")]
    pub min_contrast: f32,
    #[serde(default = "default_max_peaks_per_frame")]
    pub max_peaks_per_frame: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FingerprintConfig {
    #[serde(default = "default_min_time_distance")]
    pub min_time_distance: u32,
    #[serde(default = "default_max_time_distance")]
    pub max_time_distance: u32,
    #[serde(default = "default_min_freq_distance")]
    pub min_freq_distance: u16,
    #[serde(default = "default_max_freq_distance")]
    pub max_freq_distance: u16,
    /// Maximum number of pairs per anchor peak.
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
    /// Size of the recently emitted hash ring, 0 disables suppression.
    #[serde(default = "default_recent_hashes")]
    pub recent_hashes: usize,
    #[serde(default)]
    pub energy_bit: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatcherConfig {
    #[serde(default = "default_min_match_count")]
    pub min_match_count: u32,
    /// Hits taken per lookup before the rest is ignored.
    #[serde(default = "default_max_collisions")]
    pub max_collisions: usize,
    /// Age in frames after which weak buckets may be pruned.
    #[serde(default = "default_max_result_age")]
    pub max_result_age: u32,
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,
    #[serde(default)]
    pub include_off_by_one: bool,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_monitor_window_secs")]
    pub monitor_window_secs: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub index_dir: Option<PathBuf>,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Journal size that triggers a compaction into a new segment.
    #[serde(default = "default_compact_journal_bytes")]
    pub compact_journal_bytes: u64,
    /// Records sorted in memory per external-sort run.
    #[serde(default = "default_sort_run_len")]
    pub sort_run_len: usize,
    /// Occurrences buffered by the runner before each insert.
    #[serde(default = "default_insert_batch")]
    pub insert_batch: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            block_size: default_block_size(),
            step_size: default_step_size(),
        }
    }
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            time_filter_size: default_filter_size(),
            freq_filter_size: default_filter_size(),
            min_magnitude: default_min_magnitude(),
            noise_floor_decay: default_noise_floor_decay(),
            min_contrast: default_min_contrast(),
            max_peaks_per_frame: default_max_peaks_per_frame(),
        }
    }
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            min_time_distance: default_min_time_distance(),
            max_time_distance: default_max_time_distance(),
            min_freq_distance: default_min_freq_distance(),
            max_freq_distance: default_max_freq_distance(),
            fan_out: default_fan_out(),
            recent_hashes: default_recent_hashes(),
            energy_bit: false,
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            min_match_count: default_min_match_count(),
            max_collisions: default_max_collisions(),
            max_result_age: default_max_result_age(),
            max_buckets: default_max_buckets(),
            include_off_by_one: false,
            max_results: default_max_results(),
            monitor_window_secs: default_monitor_window_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_dir: None,
            cache_dir: None,
            compact_journal_bytes: default_compact_journal_bytes(),
            sort_run_len: default_sort_run_len(),
            insert_batch: default_insert_batch(),
        }
    }
}

fn default_sample_rate() -> u32 { 8000 }
fn default_block_size() -> usize { 512 }
fn default_step_size() -> usize { 256 }
fn default_filter_size() -> usize { 15 }
fn default_min_magnitude() -> f32 { 0.01 }
fn default_noise_floor_decay() -> f32 { 0.95 }
fn default_min_contrast() -> f32 { 2.0 }
fn default_max_peaks_per_frame() -> usize { 3 }
fn default_min_time_distance() -> u32 { 2 }
fn default_max_time_distance() -> u32 { 48 }
fn default_min_freq_distance() -> u16 { 3 }
fn default_max_freq_distance() -> u16 { 67 }
fn default_fan_out() -> usize { 3 }
fn default_recent_hashes() -> usize { 30 }
fn default_min_match_count() -> u32 { 5 }
fn default_max_collisions() -> usize { 1000 }
fn default_max_result_age() -> u32 { 350 }
fn default_max_buckets() -> usize { 1 << 16 }
fn default_max_results() -> usize { 10 }
fn default_monitor_window_secs() -> f32 { 7.0 }
fn default_compact_journal_bytes() -> u64 { 64 << 20 }
fn default_sort_run_len() -> usize { 1 << 20 }
fn default_insert_batch() -> usize { 4096 }

impl AudioConfig {
    /// Duration of one hop, the time unit of frame indices.
    pub fn frame_seconds(&self) -> f64 {
        self.step_size as f64 / self.sample_rate as f64
    }

    pub fn bins(&self) -> usize {
        self.block_size / 2 + 1
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let a = &self.audio;
        if a.sample_rate == 0 {
            return Err(Error::Config("audio.sample_rate must be > 0".into()));
        }
        if !a.block_size.is_power_of_two() || a.block_size < 8 {
            return Err(Error::Config(format!(
                "audio.block_size must be a power of two >= 8, got {}",
                a.block_size
            )));
        }
        // peaks never sit on the Nyquist bin
        let highest_peak_bin = a.bins() - 2;
        if highest_peak_bin as u32 > MAX_FREQ_BIN {
            return Err(Error::Config(format!(
                "audio.block_size {} puts peaks above bin {}, the highest the hash holds",
                a.block_size, MAX_FREQ_BIN
            )));
        }
        if a.step_size == 0 || a.step_size > a.block_size {
            return Err(Error::Config(format!(
                "audio.step_size must be in 1..={}, got {}",
                a.block_size, a.step_size
            )));
        }

        let p = &self.peaks;
        if p.time_filter_size < 3 || p.time_filter_size % 2 == 0 {
            return Err(Error::Config("peaks.time_filter_size must be odd and >= 3".into()));
        }
        if p.freq_filter_size < 3 || p.freq_filter_size % 2 == 0 {
            return Err(Error::Config("peaks.freq_filter_size must be odd and >= 3".into()));
        }
        if !(0.0..1.0).contains(&p.noise_floor_decay) {
            return Err(Error::Config("peaks.noise_floor_decay must be in [0, 1)".into()));
        }
        if p.max_peaks_per_frame == 0 {
            return Err(Error::Config("peaks.max_peaks_per_frame must be > 0".into()));
        }

        let f = &self.fingerprint;
        if f.min_time_distance == 0 || f.min_time_distance > f.max_time_distance {
            return Err(Error::Config(
                "fingerprint time distances must satisfy 0 < min <= max".into(),
            ));
        }
        if f.max_time_distance > MAX_TIME_DELTA {
            return Err(Error::Config(format!(
                "fingerprint.max_time_distance must be <= {}",
                MAX_TIME_DELTA
            )));
        }
        if f.max_freq_distance > MAX_FREQ_DISTANCE {
            return Err(Error::Config(format!(
                "fingerprint.max_freq_distance must be <= {}",
                MAX_FREQ_DISTANCE
            )));
        }
        if f.min_freq_distance > f.max_freq_distance {
            return Err(Error::Config(
                "fingerprint.min_freq_distance must be <= max_freq_distance".into(),
            ));
        }
        if f.fan_out == 0 {
            return Err(Error::Config("fingerprint.fan_out must be > 0".into()));
        }

        if self.matcher.max_collisions == 0 {
            return Err(Error::Config("matcher.max_collisions must be > 0".into()));
        }
        if self.matcher.monitor_window_secs <= 0.0 {
            return Err(Error::Config("matcher.monitor_window_secs must be > 0".into()));
        }
        if self.storage.sort_run_len == 0 || self.storage.insert_batch == 0 {
            return Err(Error::Config(
                "storage.sort_run_len and storage.insert_batch must be > 0".into(),
            ));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let config: Config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}
