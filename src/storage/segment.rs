//! Immutable on-disk snapshot of the index.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! header      magic "EMKSEG\0\0", version u32, generation u64,
//!             reference count u64, hash count u64, occurrence count u64
//! references  (id u64, fingerprints u64, duration f32)*, ids ascending
//! directory   (hash u32, count u32)*, hashes strictly ascending
//! occurrences (reference id u64, t1 u32)*, grouped by directory order
//! trailer     magic "EMKEND\0\0"
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::codec::{put_f32, put_u32, put_u64, Decoder};
use super::{Occurrence, ReferenceInfo};
use crate::error::{Error, Result};

const MAGIC: &[u8; 8] = b"EMKSEG\0\0";
const TRAILER: &[u8; 8] = b"EMKEND\0\0";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 44;
const REFERENCE_LEN: u64 = 20;
const DIRECTORY_ENTRY_LEN: u64 = 8;
const OCCURRENCE_LEN: u64 = 12;

pub(crate) struct Segment {
    pub generation: u64,
    pub refs: BTreeMap<u64, ReferenceInfo>,
    pub table: HashMap<u32, Vec<Occurrence>>,
}

pub(crate) fn read(path: &Path) -> Result<Segment> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let file_len = file.metadata().map_err(|e| Error::io(path, e))?.len();
    let mut dec = Decoder::new(BufReader::new(file), path);

    if &dec.bytes::<8>()? != MAGIC {
        return Err(dec.malformed("bad magic"));
    }
    let version = dec.u32()?;
    if version != VERSION {
        return Err(dec.malformed(format!("unsupported version {}", version)));
    }
    let generation = dec.u64()?;
    let ref_count = dec.u64()?;
    let hash_count = dec.u64()?;
    let occurrence_count = dec.u64()?;

    // The counts fix the file size; check it before they size anything.
    let expected = [
        (ref_count, REFERENCE_LEN),
        (hash_count, DIRECTORY_ENTRY_LEN),
        (occurrence_count, OCCURRENCE_LEN),
    ]
    .iter()
    .try_fold(HEADER_LEN + TRAILER.len() as u64, |acc, &(count, len)| {
        count.checked_mul(len).and_then(|bytes| acc.checked_add(bytes))
    });
    if expected != Some(file_len) {
        return Err(dec.malformed(format!(
            "header counts ({} references, {} hashes, {} occurrences) do not fit a {} byte file",
            ref_count, hash_count, occurrence_count, file_len
        )));
    }

    let mut refs = BTreeMap::new();
    let mut previous_id = None;
    for _ in 0..ref_count {
        let id = dec.u64()?;
        let fingerprints = dec.u64()?;
        let duration_secs = dec.f32()?;
        if previous_id.is_some_and(|p| p >= id) {
            return Err(dec.malformed(format!("reference {} out of order", id)));
        }
        if !duration_secs.is_finite() || duration_secs < 0.0 {
            return Err(dec.malformed(format!("reference {} has invalid duration", id)));
        }
        previous_id = Some(id);
        refs.insert(id, ReferenceInfo { fingerprints, duration_secs });
    }

    let mut directory = Vec::new();
    let mut previous_hash = None;
    let mut total: u64 = 0;
    for _ in 0..hash_count {
        let hash = dec.u32()?;
        let count = dec.u32()?;
        if previous_hash.is_some_and(|p| p >= hash) {
            return Err(dec.malformed(format!("hash {:#x} out of order", hash)));
        }
        if count == 0 {
            return Err(dec.malformed(format!("hash {:#x} has no occurrences", hash)));
        }
        previous_hash = Some(hash);
        total += u64::from(count);
        directory.push((hash, count));
    }
    if total != occurrence_count {
        return Err(dec.malformed(format!(
            "directory counts {} occurrences, header says {}",
            total, occurrence_count
        )));
    }

    let known: HashSet<u64> = refs.keys().copied().collect();
    let mut table = HashMap::with_capacity(directory.len());
    for (hash, count) in directory {
        let mut occurrences = Vec::with_capacity(count.min(1 << 16) as usize);
        for _ in 0..count {
            let reference_id = dec.u64()?;
            let t1 = dec.u32()?;
            if !known.contains(&reference_id) {
                return Err(dec.malformed(format!("occurrence of unknown reference {}", reference_id)));
            }
            occurrences.push(Occurrence { reference_id, t1 });
        }
        table.insert(hash, occurrences);
    }

    if &dec.bytes::<8>()? != TRAILER {
        return Err(dec.malformed("bad trailer"));
    }
    if !dec.at_eof()? {
        return Err(dec.malformed(format!("trailing bytes after offset {}", dec.offset())));
    }

    Ok(Segment { generation, refs, table })
}

/// Write a segment to `path` and fsync it.
pub(crate) fn write(
    path: &Path,
    generation: u64,
    refs: &BTreeMap<u64, ReferenceInfo>,
    table: &HashMap<u32, Vec<Occurrence>>,
) -> Result<()> {
    let io = |e| Error::io(path, e);
    let file = File::create(path).map_err(io)?;
    let mut w = BufWriter::new(file);

    let mut hashes: Vec<u32> = table
        .iter()
        .filter(|(_, occurrences)| !occurrences.is_empty())
        .map(|(&hash, _)| hash)
        .collect();
    hashes.sort_unstable();
    let occurrence_count: u64 = hashes.iter().map(|h| table[h].len() as u64).sum();

    w.write_all(MAGIC).map_err(io)?;
    put_u32(&mut w, VERSION).map_err(io)?;
    put_u64(&mut w, generation).map_err(io)?;
    put_u64(&mut w, refs.len() as u64).map_err(io)?;
    put_u64(&mut w, hashes.len() as u64).map_err(io)?;
    put_u64(&mut w, occurrence_count).map_err(io)?;

    for (&id, info) in refs {
        put_u64(&mut w, id).map_err(io)?;
        put_u64(&mut w, info.fingerprints).map_err(io)?;
        put_f32(&mut w, info.duration_secs).map_err(io)?;
    }
    for hash in &hashes {
        put_u32(&mut w, *hash).map_err(io)?;
        put_u32(&mut w, table[hash].len() as u32).map_err(io)?;
    }
    for hash in &hashes {
        for occurrence in &table[hash] {
            put_u64(&mut w, occurrence.reference_id).map_err(io)?;
            put_u32(&mut w, occurrence.t1).map_err(io)?;
        }
    }
    w.write_all(TRAILER).map_err(io)?;

    let file = w.into_inner().map_err(|e| Error::io(path, e.into_error()))?;
    file.sync_all().map_err(io)?;
    Ok(())
}

/// Write the next segment to `dir/index.seg.tmp` and fsync it.
///
/// Nothing visible changes until [`commit`]. On failure the staging file is
/// removed.
pub(crate) fn stage(
    dir: &Path,
    generation: u64,
    refs: &BTreeMap<u64, ReferenceInfo>,
    table: &HashMap<u32, Vec<Occurrence>>,
) -> Result<PathBuf> {
    let staging = dir.join(format!("{}.tmp", super::SEGMENT_FILE));
    if let Err(e) = write(&staging, generation, refs, table) {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }
    Ok(staging)
}

/// Atomically rename a staged segment over `dir/index.seg`.
pub(crate) fn commit(dir: &Path, staging: &Path) -> Result<()> {
    let target = dir.join(super::SEGMENT_FILE);
    fs::rename(staging, &target).map_err(|e| Error::io(&target, e))?;
    log::debug!("published segment {}", target.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(
        dir: &Path,
        generation: u64,
        refs: &BTreeMap<u64, ReferenceInfo>,
        table: &HashMap<u32, Vec<Occurrence>>,
    ) {
        let staging = stage(dir, generation, refs, table).unwrap();
        commit(dir, &staging).unwrap();
    }

    fn sample() -> (BTreeMap<u64, ReferenceInfo>, HashMap<u32, Vec<Occurrence>>) {
        let mut refs = BTreeMap::new();
        refs.insert(7, ReferenceInfo { fingerprints: 3, duration_secs: 12.5 });
        refs.insert(9, ReferenceInfo { fingerprints: 1, duration_secs: 4.0 });

        let mut table = HashMap::new();
        table.insert(
            0x00ab_cdef,
            vec![Occurrence { reference_id: 7, t1: 4 }, Occurrence { reference_id: 9, t1: 80 }],
        );
        table.insert(0x10, vec![Occurrence { reference_id: 7, t1: 1 }]);
        table.insert(0x11, vec![Occurrence { reference_id: 7, t1: 2 }]);
        (refs, table)
    }

    #[test]
    fn publish_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let (refs, table) = sample();
        publish(dir.path(), 3, &refs, &table);

        let segment = read(&dir.path().join(crate::storage::SEGMENT_FILE)).unwrap();
        assert_eq!(segment.generation, 3);
        assert_eq!(segment.refs, refs);
        assert_eq!(segment.table, table);
        assert!(!dir.path().join("index.seg.tmp").exists());
    }

    #[test]
    fn detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let (refs, table) = sample();
        publish(dir.path(), 1, &refs, &table);
        let path = dir.path().join(crate::storage::SEGMENT_FILE);
        let bytes = fs::read(&path).unwrap();

        // truncated
        fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();
        assert!(matches!(read(&path), Err(Error::Format { .. })));

        // trailing garbage
        let mut longer = bytes.clone();
        longer.extend_from_slice(b"xx");
        fs::write(&path, &longer).unwrap();
        assert!(matches!(read(&path), Err(Error::Format { .. })));

        // directory out of order: swap the first two directory entries
        let dir_start = 8 + 4 + 8 * 4 + refs.len() * 20;
        let mut swapped = bytes.clone();
        let (a, b) = (dir_start, dir_start + 8);
        let first: Vec<u8> = swapped[a..a + 8].to_vec();
        let second: Vec<u8> = swapped[b..b + 8].to_vec();
        swapped[a..a + 8].copy_from_slice(&second);
        swapped[b..b + 8].copy_from_slice(&first);
        fs::write(&path, &swapped).unwrap();
        assert!(matches!(read(&path), Err(Error::Format { .. })));

        // oversized counts are rejected before anything is allocated
        let occurrences_at = 8 + 4 + 8 * 3;
        let mut huge = bytes.clone();
        huge[occurrences_at..occurrences_at + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&path, &huge).unwrap();
        assert!(matches!(read(&path), Err(Error::Format { .. })));

        let mut huge = bytes.clone();
        huge[occurrences_at..occurrences_at + 8].copy_from_slice(&u64::from(u32::MAX).to_le_bytes());
        huge[dir_start + 4..dir_start + 8].copy_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, &huge).unwrap();
        assert!(matches!(read(&path), Err(Error::Format { .. })));

        // a directory count lying within a well-sized file
        let mut lying = bytes.clone();
        lying[dir_start + 4..dir_start + 8].copy_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, &lying).unwrap();
        assert!(matches!(read(&path), Err(Error::Format { .. })));

        // bad magic
        let mut magic = bytes;
        magic[0] = b'X';
        fs::write(&path, &magic).unwrap();
        assert!(matches!(read(&path), Err(Error::Format { .. })));
    }

    #[test]
    fn missing_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = read(&dir.path().join("nope.seg"));
        assert!(matches!(result, Err(Error::StorageIo { .. })));
    }
}
