//! Text dumps of index records and the external sort that feeds bulk builds.
//!
//! A dump is one `hash,reference_id,t1` record per line. Workers write one
//! sorted dump per item; [`MergeSort`] turns any number of dumps into a single
//! ascending stream without holding them all in memory.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

/// Extension of per-item dump files.
pub const DUMP_EXTENSION: &str = "tdb";

/// Field order gives the sort order: hash, then reference, then time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DumpRecord {
    pub hash: u32,
    pub reference_id: u64,
    pub t1: u32,
}

impl DumpRecord {
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let mut fields = line.trim().split(',');
        let mut next = |name: &str| {
            fields
                .next()
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .ok_or_else(|| format!("missing {}", name))
        };
        let hash = next("hash")?;
        let reference_id = next("reference id")?;
        let t1 = next("t1")?;
        if fields.next().is_some() {
            return Err("too many fields".into());
        }

        Ok(Self {
            hash: hash.parse().map_err(|_| format!("bad hash {:?}", hash))?,
            reference_id: reference_id
                .parse()
                .map_err(|_| format!("bad reference id {:?}", reference_id))?,
            t1: t1.parse().map_err(|_| format!("bad t1 {:?}", t1))?,
        })
    }
}

impl fmt::Display for DumpRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.hash, self.reference_id, self.t1)
    }
}

/// Streaming parser over dump lines. Blank lines are skipped.
pub struct DumpReader<R> {
    lines: std::io::Lines<R>,
    source: String,
    line_no: usize,
}

impl<R: BufRead> DumpReader<R> {
    pub fn new(reader: R, source: impl Into<String>) -> Self {
        Self {
            lines: reader.lines(),
            source: source.into(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for DumpReader<R> {
    type Item = Result<DumpRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(Error::io(Path::new(&self.source), e))),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(DumpRecord::parse(&line).map_err(|message| {
                Error::format(format!("{}:{}", self.source, self.line_no), message)
            }));
        }
    }
}

pub fn open_dump(path: &Path) -> Result<DumpReader<BufReader<File>>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    Ok(DumpReader::new(BufReader::new(file), path.display().to_string()))
}

pub fn write_records<'a, W: Write>(
    writer: &mut W,
    records: impl IntoIterator<Item = &'a DumpRecord>,
) -> std::io::Result<u64> {
    let mut written = 0;
    for record in records {
        writeln!(writer, "{}", record)?;
        written += 1;
    }
    Ok(written)
}

/// Write the sorted dump of one item as `<dir>/<reference_id>.tdb`.
///
/// The file is staged under a temporary name and renamed into place, so a
/// reader never sees a partial dump.
pub fn write_item_dump(dir: &Path, reference_id: u64, fingerprints: &[Fingerprint]) -> Result<PathBuf> {
    let mut records: Vec<DumpRecord> = fingerprints
        .iter()
        .map(|fp| DumpRecord {
            hash: fp.hash,
            reference_id,
            t1: fp.t1,
        })
        .collect();
    records.sort_unstable();

    let target = dir.join(format!("{}.{}", reference_id, DUMP_EXTENSION));
    let staging = dir.join(format!("{}.{}.tmp", reference_id, DUMP_EXTENSION));
    let io = |e| Error::io(&staging, e);

    let file = File::create(&staging).map_err(io)?;
    let mut w = BufWriter::new(file);
    write_records(&mut w, &records).map_err(io)?;
    let file = w.into_inner().map_err(|e| io(e.into_error()))?;
    file.sync_all().map_err(io)?;
    drop(file);

    fs::rename(&staging, &target).map_err(|e| Error::io(&target, e))?;
    Ok(target)
}

pub type SortedRecords = Box<dyn Iterator<Item = Result<DumpRecord>> + Send>;

/// Sorts dump files of arbitrary size into one ascending record stream.
pub trait ExternalSort {
    fn sort(&self, inputs: &[PathBuf]) -> Result<SortedRecords>;
}

/// Run-based merge sort: runs of at most `run_len` records are sorted in
/// memory and spilled to scratch files, then merged through a binary heap.
#[derive(Clone, Debug)]
pub struct MergeSort {
    run_len: usize,
    scratch_dir: Option<PathBuf>,
}

impl MergeSort {
    pub fn new(run_len: usize) -> Self {
        Self {
            run_len: run_len.max(1),
            scratch_dir: None,
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    fn spill(&self, run: &mut Vec<DumpRecord>) -> Result<File> {
        run.sort_unstable();
        let scratch = self
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let io = |e| Error::io(&scratch, e);

        let file = tempfile::tempfile_in(&scratch).map_err(io)?;
        let mut w = BufWriter::new(file);
        write_records(&mut w, run.iter()).map_err(io)?;
        let mut file = w.into_inner().map_err(|e| io(e.into_error()))?;
        file.seek(SeekFrom::Start(0)).map_err(io)?;

        log::debug!("spilled sorted run of {} records", run.len());
        run.clear();
        Ok(file)
    }
}

impl ExternalSort for MergeSort {
    fn sort(&self, inputs: &[PathBuf]) -> Result<SortedRecords> {
        let mut run = Vec::with_capacity(self.run_len.min(1 << 20));
        let mut spilled = Vec::new();

        for path in inputs {
            for record in open_dump(path)? {
                run.push(record?);
                if run.len() >= self.run_len {
                    spilled.push(self.spill(&mut run)?);
                }
            }
        }

        if spilled.is_empty() {
            run.sort_unstable();
            return Ok(Box::new(run.into_iter().map(Ok)));
        }
        if !run.is_empty() {
            spilled.push(self.spill(&mut run)?);
        }

        log::info!("merging {} sorted runs", spilled.len());
        let runs = spilled
            .into_iter()
            .enumerate()
            .map(|(i, file)| DumpReader::new(BufReader::new(file), format!("sort run {}", i)))
            .collect();
        Ok(Box::new(MergedRuns::new(runs)?))
    }
}

/// K-way merge holding one pending record per run.
struct MergedRuns {
    runs: Vec<DumpReader<BufReader<File>>>,
    heap: BinaryHeap<Reverse<(DumpRecord, usize)>>,
}

impl MergedRuns {
    fn new(mut runs: Vec<DumpReader<BufReader<File>>>) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(runs.len());
        for (i, run) in runs.iter_mut().enumerate() {
            if let Some(record) = run.next() {
                heap.push(Reverse((record?, i)));
            }
        }
        Ok(Self { runs, heap })
    }
}

impl Iterator for MergedRuns {
    type Item = Result<DumpRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((record, i)) = self.heap.pop()?;
        match self.runs[i].next() {
            Some(Ok(next)) => self.heap.push(Reverse((next, i))),
            Some(Err(e)) => {
                self.heap.clear();
                return Some(Err(e));
            }
            None => {}
        }
        Some(Ok(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: u32, reference_id: u64, t1: u32) -> DumpRecord {
        DumpRecord { hash, reference_id, t1 }
    }

    #[test]
    fn parses_lines_and_reports_position() {
        let text = "5,1,10\n\n  7 , 2 , 3 \n9,x,1\n";
        let mut reader = DumpReader::new(text.as_bytes(), "mem");
        assert_eq!(reader.next().unwrap().unwrap(), record(5, 1, 10));
        assert_eq!(reader.next().unwrap().unwrap(), record(7, 2, 3));
        match reader.next().unwrap() {
            Err(Error::Format { context, .. }) => assert_eq!(context, "mem:4"),
            other => panic!("expected format error, got {:?}", other),
        }

        assert!(DumpRecord::parse("1,2").is_err());
        assert!(DumpRecord::parse("1,2,3,4").is_err());
        assert!(DumpRecord::parse("4294967296,1,1").is_err());
        assert_eq!(record(3, 4, 5).to_string(), "3,4,5");
    }

    #[test]
    fn item_dump_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let fp = |t1: u32, hash: u32| Fingerprint { t1, f1: 1, t2: t1 + 3, f2: 9, hash, flags: 0 };
        let path = write_item_dump(dir.path(), 42, &[fp(9, 300), fp(1, 100), fp(4, 300)]).unwrap();

        assert_eq!(path.file_name().unwrap(), "42.tdb");
        let records: Vec<DumpRecord> = open_dump(&path).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records, vec![record(100, 42, 1), record(300, 42, 4), record(300, 42, 9)]);
        assert!(!dir.path().join("42.tdb.tmp").exists());
    }

    #[test]
    fn merges_spilled_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut expected = Vec::new();
        let mut inputs = Vec::new();
        for file in 0..3u64 {
            let records: Vec<DumpRecord> = (0..25u32)
                .map(|i| record((i * 7919 + file as u32 * 31) % 97, file, i))
                .collect();
            expected.extend(records.iter().copied());
            let path = dir.path().join(format!("{}.tdb", file));
            let mut f = File::create(&path).unwrap();
            write_records(&mut f, &records).unwrap();
            inputs.push(path);
        }
        expected.sort();

        let scratch = tempfile::tempdir().unwrap();
        let sorter = MergeSort::new(10).with_scratch_dir(scratch.path());
        let merged: Vec<DumpRecord> = sorter.sort(&inputs).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(merged, expected);

        let in_memory = MergeSort::new(1000);
        let merged: Vec<DumpRecord> = in_memory.sort(&inputs).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(merged, expected);
    }

    #[test]
    fn malformed_input_fails_the_sort() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tdb");
        fs::write(&path, "1,2,3\nnot a record\n").unwrap();
        assert!(matches!(
            MergeSort::new(10).sort(&[path]),
            Err(Error::Format { .. })
        ));
    }
}
