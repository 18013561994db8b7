use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "earmark", version, about = "Acoustic fingerprinting: index recordings and identify excerpts")]
pub struct Cli {
    /// Config file (default: ./earmark.toml, then ~/.config/earmark/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Index directory (overrides storage.index_dir)
    #[arg(long, global = true)]
    pub index: Option<PathBuf>,

    /// Print results as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    /// Worker threads for batch extraction (default: all cores)
    #[arg(long, global = true)]
    pub threads: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fingerprint recordings and add them to the index
    Store {
        /// Audio files, directories (one level deep) or .txt lists of files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Reference id to use instead of the path hash (single input only)
        #[arg(long)]
        id: Option<u64>,
    },

    /// Fingerprint recordings into per-item dumps for a later `build`
    Cache {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Dump directory (overrides storage.cache_dir)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },

    /// Rebuild the index from the dumps in the cache directory
    Build {
        /// Extra dump files to include
        dumps: Vec<PathBuf>,

        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },

    /// Identify recordings or excerpts ("-" reads raw f32 samples from stdin)
    Query {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Minimum aligned hits for a result (overrides matcher.min_match_count)
        #[arg(long)]
        min_match_count: Option<u32>,

        /// Also probe hashes one frame off in time
        #[arg(long)]
        off_by_one: bool,
    },

    /// Identify a live stream window by window ("-" reads stdin)
    Monitor {
        input: PathBuf,

        /// Window length in seconds (overrides matcher.monitor_window_secs)
        #[arg(long)]
        window: Option<f32>,
    },

    /// Find stored recordings that also occur in other stored recordings
    Dedup {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Remove recordings from the index
    Delete {
        /// Audio files whose path-derived ids are removed
        inputs: Vec<PathBuf>,

        /// Reference ids to remove
        #[arg(long = "id")]
        ids: Vec<u64>,
    },

    /// Show index statistics
    Stats {
        /// Also list every reference
        #[arg(long)]
        verbose: bool,
    },

    /// Remove everything from the index
    Clear,

    /// Print the fingerprints of a recording
    Print {
        input: PathBuf,

        /// Write 17-byte little-endian records instead of text
        #[arg(long)]
        binary: bool,
    },

    /// Export the index as a sorted hash,reference_id,t1 dump
    Dump {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
