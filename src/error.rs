use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors surfaced by the fingerprinting engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Unreadable, empty or mismatched audio input. Reported per item.
    #[error("input: {0}")]
    Input(String),

    /// Malformed dump, segment or journal contents.
    #[error("format: {context}: {message}")]
    Format { context: String, message: String },

    /// Filesystem failure while reading or writing index state.
    #[error("storage I/O on {}: {source}", path.display())]
    StorageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn format(context: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Format {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Error::StorageIo {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True for errors that only concern the item being processed.
    pub fn is_per_item(&self) -> bool {
        matches!(self, Error::Input(_))
    }
}
