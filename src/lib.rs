//! Acoustic fingerprinting.
//!
//! Audio is turned into spectral peaks, peaks into pair hashes, and hashes
//! into an on-disk index. A query is identified by voting on the time offset
//! between its hashes and the indexed occurrences.

pub mod audio;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod matcher;
pub mod spectral;
pub mod storage;
pub mod stream;

pub use config::{load_config, Config};
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use matcher::{MatchResult, Matcher, QueryReport};
pub use storage::{Index, IndexStats};
pub use stream::{CancelToken, Extractor, FingerprintStream, StreamRunner};
