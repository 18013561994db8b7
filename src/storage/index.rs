use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use super::dump::{write_records, DumpRecord};
use super::journal::{Journal, JournalOp};
use super::segment;
use super::{IndexStats, Occurrence, ReferenceInfo, JOURNAL_FILE, SEGMENT_FILE};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

/// Hash to occurrences index with per-reference metadata.
///
/// Readers share the state lock. Writers first take the journal mutex, log
/// the change, then apply it under the write lock, so a reader sees a change
/// either completely or not at all.
pub struct Index {
    dir: Option<PathBuf>,
    frame_seconds: f64,
    compact_journal_bytes: u64,
    state: RwLock<IndexState>,
    journal: Mutex<Option<Journal>>,
}

#[derive(Default)]
struct IndexState {
    generation: u64,
    table: HashMap<u32, Vec<Occurrence>>,
    refs: BTreeMap<u64, ReferenceInfo>,
    entry_count: u64,
}

impl IndexState {
    fn apply(&mut self, op: &JournalOp, frame_seconds: f64) {
        match op {
            JournalOp::Insert { reference_id, entries } => {
                let mut last_t1 = 0;
                for &(hash, t1) in entries {
                    self.table.entry(hash).or_default().push(Occurrence {
                        reference_id: *reference_id,
                        t1,
                    });
                    last_t1 = last_t1.max(t1);
                }
                self.entry_count += entries.len() as u64;

                let info = self.refs.entry(*reference_id).or_default();
                info.fingerprints += entries.len() as u64;
                info.duration_secs = info.duration_secs.max((last_t1 as f64 * frame_seconds) as f32);
            }
            JournalOp::Delete { reference_id } => {
                if self.refs.remove(reference_id).is_none() {
                    return;
                }
                let mut removed = 0u64;
                self.table.retain(|_, occurrences| {
                    let before = occurrences.len();
                    occurrences.retain(|o| o.reference_id != *reference_id);
                    removed += (before - occurrences.len()) as u64;
                    !occurrences.is_empty()
                });
                self.entry_count -= removed;
            }
            JournalOp::Duration { reference_id, secs } => {
                self.refs.entry(*reference_id).or_default().duration_secs = *secs;
            }
            JournalOp::Retract { reference_id, entries } => {
                let mut removed = 0u64;
                for &(hash, t1) in entries {
                    let Some(occurrences) = self.table.get_mut(&hash) else {
                        continue;
                    };
                    let found = occurrences
                        .iter()
                        .rposition(|o| o.reference_id == *reference_id && o.t1 == t1);
                    if let Some(at) = found {
                        occurrences.remove(at);
                        removed += 1;
                        if occurrences.is_empty() {
                            self.table.remove(&hash);
                        }
                    }
                }
                self.entry_count -= removed;
                if let Some(info) = self.refs.get_mut(reference_id) {
                    info.fingerprints = info.fingerprints.saturating_sub(removed);
                }
            }
        }
    }
}

impl Index {
    /// Open (or create) the index stored in `dir`, replaying its journal.
    pub fn open(dir: &Path, config: &Config) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

        let staging = dir.join(format!("{}.tmp", SEGMENT_FILE));
        if staging.exists() {
            log::warn!("removing unfinished segment {}", staging.display());
            fs::remove_file(&staging).map_err(|e| Error::io(&staging, e))?;
        }

        let frame_seconds = config.audio.frame_seconds();
        let segment_path = dir.join(SEGMENT_FILE);
        let mut state = if segment_path.exists() {
            let segment = segment::read(&segment_path)?;
            let entry_count = segment.table.values().map(|o| o.len() as u64).sum();
            IndexState {
                generation: segment.generation,
                table: segment.table,
                refs: segment.refs,
                entry_count,
            }
        } else {
            IndexState::default()
        };

        let journal_path = dir.join(JOURNAL_FILE);
        let staged = staged_journal(dir, state.generation);
        if staged.is_file() {
            log::warn!("recovering journal {} of the current segment", staged.display());
            fs::rename(&staged, &journal_path).map_err(|e| Error::io(&journal_path, e))?;
        }
        let (journal, ops) = Journal::open(&journal_path, state.generation)?;
        for op in &ops {
            state.apply(op, frame_seconds);
        }

        log::info!(
            "opened index {} (generation {}, {} references, {} entries)",
            dir.display(),
            state.generation,
            state.refs.len(),
            state.entry_count
        );

        Ok(Self {
            dir: Some(dir.to_path_buf()),
            frame_seconds,
            compact_journal_bytes: config.storage.compact_journal_bytes,
            state: RwLock::new(state),
            journal: Mutex::new(Some(journal)),
        })
    }

    /// An index that never touches the disk.
    pub fn in_memory(config: &Config) -> Self {
        Self {
            dir: None,
            frame_seconds: config.audio.frame_seconds(),
            compact_journal_bytes: config.storage.compact_journal_bytes,
            state: RwLock::new(IndexState::default()),
            journal: Mutex::new(None),
        }
    }

    pub fn frame_seconds(&self) -> f64 {
        self.frame_seconds
    }

    /// Add the fingerprints of one reference. Existing occurrences, even
    /// identical ones, are kept.
    pub fn insert(&self, reference_id: u64, fingerprints: &[Fingerprint]) -> Result<()> {
        if fingerprints.is_empty() {
            return Ok(());
        }
        let op = JournalOp::Insert {
            reference_id,
            entries: fingerprints.iter().map(|f| (f.hash, f.t1)).collect(),
        };
        let mut journal = self.journal.lock();
        self.commit(&mut journal, &op)
    }

    pub fn record_duration(&self, reference_id: u64, secs: f32) -> Result<()> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(Error::Input(format!("invalid duration {} for {}", secs, reference_id)));
        }
        let op = JournalOp::Duration { reference_id, secs };
        let mut journal = self.journal.lock();
        self.commit(&mut journal, &op)
    }

    /// Remove every occurrence and the metadata of `reference_id`.
    ///
    /// Returns `false` when the reference is unknown.
    pub fn delete(&self, reference_id: u64) -> Result<bool> {
        let mut journal = self.journal.lock();
        if !self.state.read().refs.contains_key(&reference_id) {
            return Ok(false);
        }
        self.commit(&mut journal, &JournalOp::Delete { reference_id })?;
        Ok(true)
    }

    /// Take back occurrences added by [`Index::insert`], the most recent
    /// match first. The reference itself stays, even when nothing is left.
    pub fn retract(&self, reference_id: u64, fingerprints: &[Fingerprint]) -> Result<()> {
        if fingerprints.is_empty() {
            return Ok(());
        }
        let op = JournalOp::Retract {
            reference_id,
            entries: fingerprints.iter().map(|f| (f.hash, f.t1)).collect(),
        };
        let mut journal = self.journal.lock();
        self.commit(&mut journal, &op)
    }

    fn commit(&self, journal: &mut Option<Journal>, op: &JournalOp) -> Result<()> {
        if let Some(journal) = journal.as_mut() {
            journal.append(op)?;
        }
        self.state.write().apply(op, self.frame_seconds);

        let oversized = journal
            .as_ref()
            .is_some_and(|j| j.len() > self.compact_journal_bytes);
        if oversized {
            log::info!("journal exceeds {} bytes, compacting", self.compact_journal_bytes);
            self.compact_locked(journal)?;
        }
        Ok(())
    }

    /// Replace the whole index with `records`, which must ascend by hash.
    ///
    /// Nothing changes unless the full stream is valid and, for an on-disk
    /// index, the new segment has been written.
    pub fn bulk_build<I>(&self, records: I) -> Result<IndexStats>
    where
        I: IntoIterator<Item = Result<DumpRecord>>,
    {
        let mut table: HashMap<u32, Vec<Occurrence>> = HashMap::new();
        let mut refs: BTreeMap<u64, ReferenceInfo> = BTreeMap::new();
        let mut run: Vec<Occurrence> = Vec::new();
        let mut current: Option<u32> = None;
        let mut entry_count = 0u64;

        for record in records {
            let record = record?;
            match current {
                Some(hash) if record.hash < hash => {
                    return Err(Error::format(
                        "bulk build",
                        format!(
                            "record {} ({}) is not sorted after hash {}",
                            entry_count + 1,
                            record,
                            hash
                        ),
                    ));
                }
                Some(hash) if record.hash == hash => {}
                _ => {
                    if let Some(hash) = current {
                        table.insert(hash, std::mem::take(&mut run));
                    }
                    current = Some(record.hash);
                }
            }
            run.push(Occurrence {
                reference_id: record.reference_id,
                t1: record.t1,
            });
            entry_count += 1;

            let info = refs.entry(record.reference_id).or_default();
            info.fingerprints += 1;
            info.duration_secs = info
                .duration_secs
                .max((record.t1 as f64 * self.frame_seconds) as f32);
        }
        if let Some(hash) = current {
            table.insert(hash, run);
        }

        let mut journal = self.journal.lock();
        let generation = self.state.read().generation + 1;
        if let Some(dir) = &self.dir {
            *journal = Some(publish_generation(dir, generation, &refs, &table)?);
        }

        let new_state = IndexState {
            generation,
            table,
            refs,
            entry_count,
        };
        *self.state.write() = new_state;
        drop(journal);

        let stats = self.stats();
        log::info!(
            "bulk build: {} entries, {} hashes, {} references",
            stats.entry_count,
            stats.distinct_hashes,
            stats.song_count
        );
        Ok(stats)
    }

    /// Occurrences of `hash`, empty when it was never seen.
    pub fn lookup(&self, hash: u32) -> Vec<Occurrence> {
        self.state
            .read()
            .table
            .get(&hash)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has(&self, reference_id: u64) -> bool {
        self.state.read().refs.contains_key(&reference_id)
    }

    pub fn reference(&self, reference_id: u64) -> Option<ReferenceInfo> {
        self.state.read().refs.get(&reference_id).copied()
    }

    /// All references in ascending id order.
    pub fn references(&self) -> Vec<(u64, ReferenceInfo)> {
        self.state
            .read()
            .refs
            .iter()
            .map(|(&id, &info)| (id, info))
            .collect()
    }

    /// Snapshot of every record, in dump order.
    pub fn records(&self) -> Vec<DumpRecord> {
        let state = self.state.read();
        let mut records: Vec<DumpRecord> = Vec::with_capacity(state.entry_count as usize);
        for (&hash, occurrences) in &state.table {
            records.extend(occurrences.iter().map(|o| DumpRecord {
                hash,
                reference_id: o.reference_id,
                t1: o.t1,
            }));
        }
        drop(state);
        records.sort_unstable();
        records
    }

    /// Write every record as a dump, ascending, ready for [`Index::bulk_build`].
    pub fn export_dump<W: Write>(&self, writer: &mut W) -> std::io::Result<u64> {
        write_records(writer, &self.records())
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.state.read();
        IndexStats {
            song_count: state.refs.len(),
            total_duration_secs: state.refs.values().map(|r| r.duration_secs as f64).sum(),
            entry_count: state.entry_count,
            distinct_hashes: state.table.len(),
        }
    }

    /// Fold the journal into a fresh segment.
    pub fn compact(&self) -> Result<()> {
        let mut journal = self.journal.lock();
        self.compact_locked(&mut journal)
    }

    fn compact_locked(&self, journal: &mut Option<Journal>) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let (generation, fresh) = {
            let state = self.state.read();
            let generation = state.generation + 1;
            (generation, publish_generation(dir, generation, &state.refs, &state.table)?)
        };
        *journal = Some(fresh);
        self.state.write().generation = generation;
        Ok(())
    }

    /// Drop every reference and occurrence.
    pub fn clear(&self) -> Result<()> {
        let mut journal = self.journal.lock();
        let generation = self.state.read().generation + 1;
        if let Some(dir) = &self.dir {
            *journal = Some(publish_generation(dir, generation, &BTreeMap::new(), &HashMap::new())?);
        }
        *self.state.write() = IndexState {
            generation,
            ..IndexState::default()
        };
        log::info!("cleared index");
        Ok(())
    }
}

fn staged_journal(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{}.{}.tmp", JOURNAL_FILE, generation))
}

/// Put a new generation on disk and return its empty journal.
///
/// The segment and the journal are both staged first. Renaming the segment
/// is the commit point: an error before it leaves the previous generation
/// untouched, and nothing after it fails the call. A journal that could not
/// be renamed stays staged and is picked up by [`Index::open`].
fn publish_generation(
    dir: &Path,
    generation: u64,
    refs: &BTreeMap<u64, ReferenceInfo>,
    table: &HashMap<u32, Vec<Occurrence>>,
) -> Result<Journal> {
    let staged = staged_journal(dir, generation);
    let mut journal = Journal::create(&staged, generation)?;
    let staged_segment = match segment::stage(dir, generation, refs, table) {
        Ok(path) => path,
        Err(e) => {
            drop(journal);
            let _ = fs::remove_file(&staged);
            return Err(e);
        }
    };
    if let Err(e) = segment::commit(dir, &staged_segment) {
        drop(journal);
        let _ = fs::remove_file(&staged);
        let _ = fs::remove_file(&staged_segment);
        return Err(e);
    }

    if let Err(e) = journal.persist(&dir.join(JOURNAL_FILE)) {
        log::error!(
            "generation {} committed, journal stays at {}: {}",
            generation,
            journal.path().display(),
            e
        );
    }
    log::debug!("generation {} published ({} references)", generation, refs.len());
    Ok(journal)
}
