//! Append-only log of the changes made since the last segment.
//!
//! The journal starts with magic "EMKJRNL\0" and the generation of the segment
//! it extends. Each record is a tag byte followed by its payload:
//!
//! ```text
//! 'I' reference id u64, count u32, (hash u32, t1 u32)*
//! 'D' reference id u64
//! 'M' reference id u64, duration f32
//! 'R' reference id u64, count u32, (hash u32, t1 u32)*
//! ```
//!
//! An append that fails part way is cut back to the last whole record.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::codec::{put_f32, put_u32, put_u64, Decoder};
use crate::error::{Error, Result};

const MAGIC: &[u8; 8] = b"EMKJRNL\0";
const HEADER_LEN: u64 = 16;

const TAG_INSERT: u8 = b'I';
const TAG_DELETE: u8 = b'D';
const TAG_DURATION: u8 = b'M';
const TAG_RETRACT: u8 = b'R';

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum JournalOp {
    Insert { reference_id: u64, entries: Vec<(u32, u32)> },
    Delete { reference_id: u64 },
    Duration { reference_id: u64, secs: f32 },
    /// Removes one occurrence per entry, the most recent first.
    Retract { reference_id: u64, entries: Vec<(u32, u32)> },
}

pub(crate) struct Journal {
    path: PathBuf,
    file: File,
    len: u64,
}

impl Journal {
    /// Start an empty journal for `generation`, replacing any existing one.
    pub fn create(path: &Path, generation: u64) -> Result<Self> {
        let io = |e| Error::io(path, e);
        let mut file = File::create(path).map_err(io)?;
        file.write_all(MAGIC).map_err(io)?;
        put_u64(&mut file, generation).map_err(io)?;
        file.sync_all().map_err(io)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len: HEADER_LEN,
        })
    }

    /// Open the journal extending segment `generation` and return the ops to
    /// replay. A missing, empty or stale journal is replaced by a fresh one.
    pub fn open(path: &Path, generation: u64) -> Result<(Self, Vec<JournalOp>)> {
        let io = |e| Error::io(path, e);
        let len = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(io(e)),
        };
        if len == 0 {
            return Ok((Self::create(path, generation)?, Vec::new()));
        }

        let file = File::open(path).map_err(io)?;
        let mut dec = Decoder::new(BufReader::new(file), path);
        if &dec.bytes::<8>()? != MAGIC {
            return Err(dec.malformed("bad journal magic"));
        }
        let stamped = dec.u64()?;
        if stamped != generation {
            log::warn!(
                "discarding stale journal {} (generation {}, segment is {})",
                path.display(),
                stamped,
                generation
            );
            return Ok((Self::create(path, generation)?, Vec::new()));
        }

        let mut ops = Vec::new();
        while !dec.at_eof()? {
            ops.push(read_op(&mut dec)?);
        }

        let file = OpenOptions::new().append(true).open(path).map_err(io)?;
        log::debug!("replaying {} journal records from {}", ops.len(), path.display());
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                len,
            },
            ops,
        ))
    }

    pub fn append(&mut self, op: &JournalOp) -> Result<()> {
        self.append_with(op, |mut file, buf| {
            file.write_all(buf)?;
            file.sync_data()
        })
    }

    fn append_with<F>(&mut self, op: &JournalOp, write: F) -> Result<()>
    where
        F: FnOnce(&File, &[u8]) -> io::Result<()>,
    {
        let mut buf = Vec::new();
        encode_op(&mut buf, op).map_err(|e| Error::io(&self.path, e))?;

        if let Err(e) = write(&self.file, &buf) {
            if let Err(cut) = self.truncate_tail() {
                log::error!(
                    "could not cut {} back to {} bytes: {}",
                    self.path.display(),
                    self.len,
                    cut
                );
            }
            return Err(Error::io(&self.path, e));
        }
        self.len += buf.len() as u64;
        Ok(())
    }

    // Drops whatever a failed append left after the last whole record.
    fn truncate_tail(&mut self) -> io::Result<()> {
        self.file.set_len(self.len)?;
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.sync_data()
    }

    /// Move the journal file to `to`, keeping the open handle.
    pub fn persist(&mut self, to: &Path) -> Result<()> {
        std::fs::rename(&self.path, to).map_err(|e| Error::io(to, e))?;
        self.path = to.to_path_buf();
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }
}

fn encode_op(w: &mut impl Write, op: &JournalOp) -> std::io::Result<()> {
    match op {
        JournalOp::Insert { reference_id, entries } => {
            w.write_all(&[TAG_INSERT])?;
            put_u64(w, *reference_id)?;
            put_entries(w, entries)?;
        }
        JournalOp::Retract { reference_id, entries } => {
            w.write_all(&[TAG_RETRACT])?;
            put_u64(w, *reference_id)?;
            put_entries(w, entries)?;
        }
        JournalOp::Delete { reference_id } => {
            w.write_all(&[TAG_DELETE])?;
            put_u64(w, *reference_id)?;
        }
        JournalOp::Duration { reference_id, secs } => {
            w.write_all(&[TAG_DURATION])?;
            put_u64(w, *reference_id)?;
            put_f32(w, *secs)?;
        }
    }
    Ok(())
}

fn put_entries(w: &mut impl Write, entries: &[(u32, u32)]) -> std::io::Result<()> {
    put_u32(w, entries.len() as u32)?;
    for &(hash, t1) in entries {
        put_u32(w, hash)?;
        put_u32(w, t1)?;
    }
    Ok(())
}

fn read_entries<R: std::io::BufRead>(dec: &mut Decoder<R>) -> Result<Vec<(u32, u32)>> {
    let count = dec.u32()?;
    let mut entries = Vec::with_capacity(count.min(1 << 16) as usize);
    for _ in 0..count {
        let hash = dec.u32()?;
        let t1 = dec.u32()?;
        entries.push((hash, t1));
    }
    Ok(entries)
}

fn read_op<R: std::io::BufRead>(dec: &mut Decoder<R>) -> Result<JournalOp> {
    let at = dec.offset();
    match dec.u8()? {
        TAG_INSERT => {
            let reference_id = dec.u64()?;
            let entries = read_entries(dec)?;
            Ok(JournalOp::Insert { reference_id, entries })
        }
        TAG_RETRACT => {
            let reference_id = dec.u64()?;
            let entries = read_entries(dec)?;
            Ok(JournalOp::Retract { reference_id, entries })
        }
        TAG_DELETE => Ok(JournalOp::Delete {
            reference_id: dec.u64()?,
        }),
        TAG_DURATION => {
            let reference_id = dec.u64()?;
            let secs = dec.f32()?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(dec.malformed(format!("invalid duration at offset {}", at)));
            }
            Ok(JournalOp::Duration { reference_id, secs })
        }
        tag => Err(dec.malformed(format!("unknown record tag {:#04x} at offset {}", tag, at))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops() -> Vec<JournalOp> {
        vec![
            JournalOp::Insert { reference_id: 5, entries: vec![(10, 1), (11, 2)] },
            JournalOp::Duration { reference_id: 5, secs: 3.5 },
            JournalOp::Retract { reference_id: 5, entries: vec![(11, 2)] },
            JournalOp::Delete { reference_id: 5 },
        ]
    }

    #[test]
    fn replays_appended_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");

        let (mut journal, replay) = Journal::open(&path, 4).unwrap();
        assert!(replay.is_empty());
        for op in ops() {
            journal.append(&op).unwrap();
        }
        let written = journal.len();
        drop(journal);

        let (journal, replay) = Journal::open(&path, 4).unwrap();
        assert_eq!(replay, ops());
        assert_eq!(journal.len(), written);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), written);
    }

    #[test]
    fn stale_generation_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let (mut journal, _) = Journal::open(&path, 1).unwrap();
        journal.append(&ops()[0]).unwrap();
        drop(journal);

        let (journal, replay) = Journal::open(&path, 2).unwrap();
        assert!(replay.is_empty());
        assert_eq!(journal.len(), HEADER_LEN);
    }

    #[test]
    fn torn_record_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let (mut journal, _) = Journal::open(&path, 0).unwrap();
        journal.append(&ops()[0]).unwrap();
        drop(journal);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(Journal::open(&path, 0), Err(Error::Format { .. })));

        let mut bad_tag = bytes;
        bad_tag[HEADER_LEN as usize] = b'Z';
        std::fs::write(&path, &bad_tag).unwrap();
        assert!(matches!(Journal::open(&path, 0), Err(Error::Format { .. })));
    }

    #[test]
    fn failed_append_leaves_no_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let (mut journal, _) = Journal::open(&path, 2).unwrap();
        journal.append(&ops()[0]).unwrap();
        let good = journal.len();

        // half the record reaches the disk, then the device fills up
        let result = journal.append_with(&ops()[1], |mut file, buf| {
            file.write_all(&buf[..buf.len() / 2])?;
            Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
        });
        assert!(matches!(result, Err(Error::StorageIo { .. })));
        assert_eq!(journal.len(), good);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good);

        journal.append(&ops()[3]).unwrap();
        drop(journal);

        let (_, replay) = Journal::open(&path, 2).unwrap();
        assert_eq!(replay, vec![ops()[0].clone(), ops()[3].clone()]);
    }

    #[test]
    fn persisted_journal_keeps_appending() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("journal.log.3.tmp");
        let live = dir.path().join("journal.log");
        let mut journal = Journal::create(&staged, 3).unwrap();
        journal.persist(&live).unwrap();
        assert_eq!(journal.path(), live.as_path());
        assert!(!staged.exists());

        journal.append(&ops()[0]).unwrap();
        drop(journal);
        let (_, replay) = Journal::open(&live, 3).unwrap();
        assert_eq!(replay, vec![ops()[0].clone()]);
    }
}
