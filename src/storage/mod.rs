//! Disk-resident fingerprint index.
//!
//! The index lives in a directory holding one immutable segment
//! (`index.seg`) and a journal of the changes made since it was written
//! (`journal.log`). The whole table is loaded into memory on open; lookups
//! never touch the disk.

mod codec;
pub mod dump;
pub mod index;
mod journal;
mod segment;

use serde::Serialize;

pub use dump::{
    open_dump, write_item_dump, DumpReader, DumpRecord, ExternalSort, MergeSort, SortedRecords,
};
pub use index::Index;

pub const SEGMENT_FILE: &str = "index.seg";
pub const JOURNAL_FILE: &str = "journal.log";

/// One place a hash was seen: which recording, at which frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Occurrence {
    pub reference_id: u64,
    pub t1: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ReferenceInfo {
    pub fingerprints: u64,
    pub duration_secs: f32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IndexStats {
    pub song_count: usize,
    pub total_duration_secs: f64,
    pub entry_count: u64,
    pub distinct_hashes: usize,
}
