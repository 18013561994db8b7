use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;

use earmark::audio::load_audio;
use earmark::storage::dump::DUMP_EXTENSION;
use earmark::storage::{write_item_dump, ExternalSort, MergeSort, ReferenceInfo};
use earmark::stream::{MemorySource, RawF32Source};
use earmark::{CancelToken, Config, Error, Extractor, FingerprintStream, Index, QueryReport, StreamRunner};

/// Extensions picked up when a directory is given as input.
pub const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "flac", "ogg", "oga", "aac", "raw"];

const STDIN: &str = "-";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub path: PathBuf,
    pub reference_id: u64,
}

/// Stable id for a recording: FNV-1a over its canonical path.
pub fn reference_id_for(path: &Path) -> u64 {
    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    fnv1a64(canonical.to_string_lossy().as_bytes())
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| AUDIO_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(e)))
}

/// Expand directories (one level, audio extensions only) and `.txt` lists.
pub fn expand_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.as_os_str() == STDIN {
            files.push(input.clone());
        } else if input.is_dir() {
            let mut found: Vec<PathBuf> = fs::read_dir(input)
                .with_context(|| format!("Failed to list {}", input.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_audio_file(p))
                .collect();
            found.sort();
            if found.is_empty() {
                log::warn!("No audio files in {}", input.display());
            }
            files.extend(found);
        } else if input.extension().is_some_and(|e| e == "txt") {
            let list = File::open(input).with_context(|| format!("Failed to open list {}", input.display()))?;
            for line in BufReader::new(list).lines() {
                let line = line.with_context(|| format!("Failed to read list {}", input.display()))?;
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    files.push(PathBuf::from(line));
                }
            }
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

/// Resolve inputs to items with reference ids, dropping repeated recordings.
pub fn items(inputs: &[PathBuf], explicit_id: Option<u64>) -> Result<Vec<Item>> {
    let files = expand_inputs(inputs)?;
    if explicit_id.is_some() && files.len() != 1 {
        bail!("--id needs exactly one input, got {}", files.len());
    }

    let mut seen = HashSet::new();
    let mut items = Vec::with_capacity(files.len());
    for path in files {
        let reference_id = explicit_id.unwrap_or_else(|| reference_id_for(&path));
        if !seen.insert(reference_id) {
            log::warn!("Skipping repeated input {}", path.display());
            continue;
        }
        items.push(Item { path, reference_id });
    }
    Ok(items)
}

fn progress(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} items ({eta} remaining)")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb
}

#[derive(Debug, PartialEq)]
enum Outcome {
    Done,
    Skipped,
    Failed,
    NotRun,
}

/// Runs `work` on every item in parallel, printing one outcome line per item.
///
/// An input error only fails its item. Any other error leaves the index or
/// cache suspect, so items not yet started are not run.
fn run_batch<F>(verb: &str, items: &[Item], work: F) -> Result<()>
where
    F: Fn(&Item) -> std::result::Result<Option<String>, Error> + Sync,
{
    let pb = progress(items.len());
    let finished = AtomicUsize::new(0);
    let halted = AtomicBool::new(false);
    let total = items.len();

    let outcomes: Vec<Outcome> = items
        .par_iter()
        .map(|item| {
            if halted.load(Ordering::SeqCst) {
                pb.inc(1);
                return Outcome::NotRun;
            }
            let (outcome, message) = match work(item) {
                Ok(Some(message)) => (Outcome::Done, message),
                Ok(None) => (Outcome::Skipped, "skipped, already done".to_string()),
                Err(e) => {
                    if !e.is_per_item() {
                        halted.store(true, Ordering::SeqCst);
                    }
                    (Outcome::Failed, format!("failed: {}", e))
                }
            };
            let n = finished.fetch_add(1, Ordering::SeqCst) + 1;
            pb.suspend(|| println!("{}/{} {} {}", n, total, item.path.display(), message));
            pb.inc(1);
            outcome
        })
        .collect();
    pb.finish_and_clear();

    let count = |kind: Outcome| outcomes.iter().filter(|o| **o == kind).count();
    let (done, skipped, failed, not_run) = (
        count(Outcome::Done),
        count(Outcome::Skipped),
        count(Outcome::Failed),
        count(Outcome::NotRun),
    );
    log::info!(
        "{}: {} done, {} skipped, {} failed, {} not run",
        verb,
        done,
        skipped,
        failed,
        not_run
    );
    if halted.load(Ordering::SeqCst) {
        bail!("{} stopped after a storage error, {} items not run", verb, not_run);
    }
    if failed > 0 {
        bail!("{} of {} items failed", failed, total);
    }
    Ok(())
}

pub fn store(index: &Index, config: &Config, items: &[Item]) -> Result<()> {
    run_batch("store", items, |item| {
        if index.has(item.reference_id) {
            return Ok(None);
        }
        let audio = load_audio(&item.path, config.audio.sample_rate)?;
        let outcome = StreamRunner::new(index, config).store(item.reference_id, MemorySource::from(audio))?;
        Ok(Some(format!(
            "-> {}: {} fingerprints, {:.1}s",
            item.reference_id, outcome.fingerprints, outcome.duration_secs
        )))
    })
}

pub fn cache(config: &Config, items: &[Item], dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    run_batch("cache", items, |item| {
        if dir.join(format!("{}.{}", item.reference_id, DUMP_EXTENSION)).exists() {
            return Ok(None);
        }
        let audio = load_audio(&item.path, config.audio.sample_rate)?;
        let fingerprints = Extractor::extract_all(config, &audio.samples);
        let path = write_item_dump(dir, item.reference_id, &fingerprints)?;
        Ok(Some(format!(
            "-> {} ({} fingerprints, {:.1}s)",
            path.display(),
            fingerprints.len(),
            audio.duration_secs()
        )))
    })
}

pub fn build(index: &Index, config: &Config, dir: &Path, extra: &[PathBuf]) -> Result<()> {
    let mut dumps: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|e| e == DUMP_EXTENSION))
            .collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };
    dumps.sort();
    dumps.extend(extra.iter().cloned());
    if dumps.is_empty() {
        bail!("No dumps to build from in {}", dir.display());
    }

    log::info!("Sorting {} dumps", dumps.len());
    let sorter = MergeSort::new(config.storage.sort_run_len).with_scratch_dir(dir);
    let records = sorter.sort(&dumps).context("Failed to sort dumps")?;
    let stats = index.bulk_build(records).context("Bulk build failed, previous index kept")?;
    println!(
        "built index: {} references, {} fingerprints, {} distinct hashes",
        stats.song_count, stats.entry_count, stats.distinct_hashes
    );
    Ok(())
}

#[derive(Serialize)]
struct QueryLine<'a> {
    query: &'a str,
    #[serde(flatten)]
    report: &'a QueryReport,
}

fn print_report(label: &str, report: &QueryReport, json: bool, matches_only: bool) -> Result<()> {
    if report.fingerprints == 0 {
        log::warn!("{}: no fingerprints extracted", label);
    }
    if json {
        println!("{}", serde_json::to_string(&QueryLine { query: label, report })?);
        return Ok(());
    }
    for result in &report.results {
        if matches_only && !result.is_match() {
            continue;
        }
        println!("{}, {}", label, result);
    }
    Ok(())
}

fn query_one(index: &Index, config: &Config, path: &Path, exclude: Option<u64>) -> earmark::Result<QueryReport> {
    let mut runner = StreamRunner::new(index, config);
    if path.as_os_str() == STDIN {
        let stdin = io::stdin();
        return runner.query(RawF32Source::new(stdin.lock(), config.audio.sample_rate), exclude);
    }
    let audio = load_audio(path, config.audio.sample_rate)?;
    runner.query(MemorySource::from(audio), exclude)
}

pub fn query(index: &Index, config: &Config, inputs: &[PathBuf], json: bool) -> Result<()> {
    let files = expand_inputs(inputs)?;
    let reports: Vec<(String, earmark::Result<QueryReport>)> = files
        .par_iter()
        .map(|path| (path.display().to_string(), query_one(index, config, path, None)))
        .collect();

    let mut failed = 0;
    for (label, report) in &reports {
        match report {
            Ok(report) => print_report(label, report, json, false)?,
            Err(e) => {
                failed += 1;
                log::error!("{}: {}", label, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} queries failed", failed, reports.len());
    }
    Ok(())
}

pub fn dedup(index: &Index, config: &Config, items: &[Item], json: bool) -> Result<()> {
    for item in items {
        if !index.has(item.reference_id) {
            log::warn!("{} is not in the index, skipping", item.path.display());
            continue;
        }
        let report = query_one(index, config, &item.path, Some(item.reference_id))
            .with_context(|| format!("Failed to check {}", item.path.display()))?;
        print_report(&item.path.display().to_string(), &report, json, true)?;
    }
    Ok(())
}

pub fn monitor(index: &Index, config: &Config, input: &Path, json: bool) -> Result<()> {
    let mut runner = StreamRunner::new(index, config);
    if input.as_os_str() == STDIN {
        let stdin = io::stdin();
        let source = RawF32Source::new(stdin.lock(), config.audio.sample_rate);
        return print_windows(runner.monitor(source)?, json);
    }
    let audio = load_audio(input, config.audio.sample_rate)?;
    print_windows(runner.monitor(MemorySource::from(audio))?, json)
}

fn print_windows<I>(windows: I, json: bool) -> Result<()>
where
    I: Iterator<Item = earmark::Result<earmark::stream::WindowReport>>,
{
    for window in windows {
        let window = window?;
        if json {
            println!("{}", serde_json::to_string(&window)?);
            continue;
        }
        for result in &window.results {
            println!("{:.2}, {}", window.start_secs, result);
        }
    }
    Ok(())
}

pub fn delete(index: &Index, inputs: &[PathBuf], ids: &[u64]) -> Result<()> {
    let mut targets: Vec<(String, u64)> = expand_inputs(inputs)?
        .into_iter()
        .map(|path| (path.display().to_string(), reference_id_for(&path)))
        .collect();
    targets.extend(ids.iter().map(|&id| (id.to_string(), id)));
    if targets.is_empty() {
        bail!("Nothing to delete: give audio files or --id");
    }

    for (label, id) in targets {
        if index.delete(id).with_context(|| format!("Failed to delete {}", label))? {
            println!("{} ({}): deleted", label, id);
        } else {
            println!("{} ({}): not in index", label, id);
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct ReferenceLine {
    reference_id: u64,
    #[serde(flatten)]
    info: ReferenceInfo,
}

pub fn stats(index: &Index, verbose: bool, json: bool) -> Result<()> {
    let stats = index.stats();
    if json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        println!("references:      {}", stats.song_count);
        println!("total duration:  {:.1}s", stats.total_duration_secs);
        println!("fingerprints:    {}", stats.entry_count);
        println!("distinct hashes: {}", stats.distinct_hashes);
        if stats.total_duration_secs > 0.0 {
            println!(
                "per second:      {:.1}",
                stats.entry_count as f64 / stats.total_duration_secs
            );
        }
    }

    if verbose {
        for (reference_id, info) in index.references() {
            if json {
                println!("{}", serde_json::to_string(&ReferenceLine { reference_id, info })?);
            } else {
                println!("{}, {}, {:.2}", reference_id, info.fingerprints, info.duration_secs);
            }
        }
    }
    Ok(())
}

pub fn print(config: &Config, input: &Path, binary: bool, json: bool) -> Result<()> {
    let fingerprints: Vec<earmark::Fingerprint> = if input.as_os_str() == STDIN {
        let stdin = io::stdin();
        let source = RawF32Source::new(stdin.lock(), config.audio.sample_rate);
        FingerprintStream::new(source, config, CancelToken::new())?.collect::<earmark::Result<_>>()?
    } else {
        let audio = load_audio(input, config.audio.sample_rate)?;
        FingerprintStream::new(MemorySource::from(audio), config, CancelToken::new())?
            .collect::<earmark::Result<_>>()?
    };

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for fp in &fingerprints {
        if binary {
            out.write_all(&fp.to_bytes())?;
        } else if json {
            writeln!(out, "{}", serde_json::to_string(fp)?)?;
        } else {
            writeln!(out, "{}, {}, {}, {}, {}, {}", fp.t1, fp.f1, fp.t2, fp.f2, fp.hash, fp.flags)?;
        }
    }
    out.flush()?;
    log::info!("{}: {} fingerprints", input.display(), fingerprints.len());
    Ok(())
}

pub fn dump(index: &Index, output: Option<&Path>) -> Result<()> {
    let written = match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            let mut w = BufWriter::new(file);
            let n = index.export_dump(&mut w)?;
            w.flush()?;
            n
        }
        None => {
            let stdout = io::stdout();
            let mut w = BufWriter::new(stdout.lock());
            let n = index.export_dump(&mut w)?;
            w.flush()?;
            n
        }
    };
    log::info!("Exported {} records", written);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_matches_reference_values() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn ids_are_stable_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.wav");
        let b = dir.path().join("b.wav");
        fs::write(&a, b"x").unwrap();
        fs::write(&b, b"x").unwrap();
        assert_eq!(reference_id_for(&a), reference_id_for(&a));
        assert_ne!(reference_id_for(&a), reference_id_for(&b));
    }

    #[test]
    fn expands_directories_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        fs::create_dir(&music).unwrap();
        for name in ["b.mp3", "a.flac", "notes.md"] {
            fs::write(music.join(name), b"").unwrap();
        }
        fs::create_dir(music.join("nested.wav")).unwrap();

        let list = dir.path().join("list.txt");
        fs::write(&list, "# queries\none.wav\n\n two.raw \n").unwrap();

        let files = expand_inputs(&[music.clone(), list, PathBuf::from("-")]).unwrap();
        assert_eq!(
            files,
            vec![
                music.join("a.flac"),
                music.join("b.mp3"),
                PathBuf::from("one.wav"),
                PathBuf::from("two.raw"),
                PathBuf::from("-"),
            ]
        );
    }

    fn batch_of(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| Item {
                path: PathBuf::from(format!("{}.wav", i)),
                reference_id: i as u64,
            })
            .collect()
    }

    #[test]
    fn input_errors_fail_only_their_item() {
        let attempted = AtomicUsize::new(0);
        let result = run_batch("test", &batch_of(6), |item| {
            attempted.fetch_add(1, Ordering::SeqCst);
            if item.reference_id % 2 == 0 {
                Err(Error::Input("unreadable".into()))
            } else {
                Ok(Some("ok".into()))
            }
        });
        assert!(result.is_err());
        assert_eq!(attempted.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn storage_errors_halt_the_batch() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let attempted = AtomicUsize::new(0);
        let result = pool.install(|| {
            run_batch("test", &batch_of(50), |_| {
                attempted.fetch_add(1, Ordering::SeqCst);
                Err(Error::io(Path::new("index"), io::Error::new(io::ErrorKind::Other, "disk gone")))
            })
        });
        let message = result.unwrap_err().to_string();
        assert!(message.contains("stopped"), "{}", message);
        assert_eq!(attempted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeated_inputs_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let song = dir.path().join("song.wav");
        fs::write(&song, b"").unwrap();
        let unique = items(&[song.clone(), song.clone()], None).unwrap();
        assert_eq!(unique.len(), 1);

        assert!(items(&[song.clone(), dir.path().join("x.wav")], Some(3)).is_err());
        assert_eq!(items(&[song], Some(3)).unwrap()[0].reference_id, 3);
    }
}
