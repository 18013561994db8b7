use std::path::{Path, PathBuf};

use serde::Serialize;

use super::{CancelToken, FingerprintStream, SampleSource};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::matcher::{MatchResult, Matcher, QueryReport};
use crate::storage::{write_item_dump, Index, ReferenceInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Extracting,
    Storing,
    Matching,
    Done,
    Error,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StoreOutcome {
    pub fingerprints: u64,
    pub duration_secs: f64,
    /// Set when the run was cancelled; nothing of the item is kept.
    pub cancelled: bool,
}

/// Ranked results for one window of a monitored stream.
#[derive(Clone, Debug, Serialize)]
pub struct WindowReport {
    pub start_secs: f64,
    pub fingerprints: u64,
    pub results: Vec<MatchResult>,
}

/// Drives one item at a time from a sample source into the index or matcher.
pub struct StreamRunner<'a> {
    index: &'a Index,
    config: Config,
    cancel: CancelToken,
    state: RunnerState,
}

impl<'a> StreamRunner<'a> {
    pub fn new(index: &'a Index, config: &Config) -> Self {
        Self {
            index,
            config: config.clone(),
            cancel: CancelToken::new(),
            state: RunnerState::Idle,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    fn open<S: SampleSource>(&mut self, source: S) -> Result<FingerprintStream<S>> {
        self.state = RunnerState::Extracting;
        FingerprintStream::new(source, &self.config, self.cancel.clone())
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        self.state = if result.is_ok() { RunnerState::Done } else { RunnerState::Error };
        result
    }

    /// Extract `source` and insert it under `reference_id` in batches.
    ///
    /// A failed or cancelled run takes back what it inserted. A reference
    /// that did not exist before is removed; one that did keeps everything
    /// stored by earlier runs.
    pub fn store<S: SampleSource>(&mut self, reference_id: u64, source: S) -> Result<StoreOutcome> {
        let prior = self.index.reference(reference_id);
        let mut inserted = prior.map(|_| Vec::new());
        let result = self.store_inner(reference_id, source, inserted.as_mut());
        let rollback = match &result {
            Ok(outcome) => outcome.cancelled,
            Err(_) => true,
        };
        if rollback {
            let undone = match (prior, inserted) {
                (None, _) => self.remove_partial(reference_id),
                (Some(info), Some(inserted)) => self.retract_partial(reference_id, info, &inserted),
                (Some(_), None) => Ok(()),
            };
            if let Err(e) = undone {
                log::error!("rollback of {} failed: {}", reference_id, e);
            }
        }
        self.settle(result)
    }

    fn remove_partial(&self, reference_id: u64) -> Result<()> {
        if self.index.delete(reference_id)? {
            log::warn!("removed partially stored reference {}", reference_id);
        }
        Ok(())
    }

    fn retract_partial(&self, reference_id: u64, prior: ReferenceInfo, inserted: &[Fingerprint]) -> Result<()> {
        if inserted.is_empty() {
            return Ok(());
        }
        log::warn!(
            "taking back {} fingerprints added to reference {}",
            inserted.len(),
            reference_id
        );
        self.index.retract(reference_id, inserted)?;
        self.index.record_duration(reference_id, prior.duration_secs)
    }

    // `inserted` collects every committed batch when the reference already
    // existed, so a rollback can take back exactly those.
    fn store_inner<S: SampleSource>(
        &mut self,
        reference_id: u64,
        source: S,
        mut inserted: Option<&mut Vec<Fingerprint>>,
    ) -> Result<StoreOutcome> {
        let mut stream = self.open(source)?;
        let batch_size = self.config.storage.insert_batch;
        let mut batch: Vec<Fingerprint> = Vec::with_capacity(batch_size);
        let mut total = 0u64;

        for fingerprint in stream.by_ref() {
            batch.push(fingerprint?);
            if batch.len() >= batch_size {
                self.state = RunnerState::Storing;
                self.index.insert(reference_id, &batch)?;
                if let Some(inserted) = inserted.as_deref_mut() {
                    inserted.extend_from_slice(&batch);
                }
                total += batch.len() as u64;
                batch.clear();
            }
        }
        if stream.was_cancelled() {
            return Ok(StoreOutcome {
                fingerprints: total + batch.len() as u64,
                duration_secs: stream.seconds(),
                cancelled: true,
            });
        }

        self.state = RunnerState::Storing;
        self.index.insert(reference_id, &batch)?;
        if let Some(inserted) = inserted.as_deref_mut() {
            inserted.extend_from_slice(&batch);
        }
        total += batch.len() as u64;

        let duration_secs = stream.seconds();
        if total > 0 {
            self.index.record_duration(reference_id, duration_secs as f32)?;
        } else {
            log::warn!("reference {} produced no fingerprints", reference_id);
        }
        log::debug!(
            "stored {} fingerprints for {} ({:.1}s)",
            total,
            reference_id,
            duration_secs
        );
        Ok(StoreOutcome {
            fingerprints: total,
            duration_secs,
            cancelled: false,
        })
    }

    /// Match `source` against the index, optionally ignoring one reference.
    pub fn query<S: SampleSource>(&mut self, source: S, exclude: Option<u64>) -> Result<QueryReport> {
        let result = self.query_inner(source, exclude);
        self.settle(result)
    }

    fn query_inner<S: SampleSource>(&mut self, source: S, exclude: Option<u64>) -> Result<QueryReport> {
        let stream = self.open(source)?;
        let mut matcher = Matcher::new(self.index, &self.config.matcher);
        if let Some(id) = exclude {
            matcher = matcher.exclude(id);
        }

        self.state = RunnerState::Matching;
        for fingerprint in stream {
            matcher.add(&fingerprint?);
        }
        Ok(matcher.report())
    }

    /// Extract `source` into a sorted per-item dump in `dir`.
    pub fn dump<S: SampleSource>(&mut self, dir: &Path, reference_id: u64, source: S) -> Result<PathBuf> {
        let result = self.dump_inner(dir, reference_id, source);
        self.settle(result)
    }

    fn dump_inner<S: SampleSource>(&mut self, dir: &Path, reference_id: u64, source: S) -> Result<PathBuf> {
        let mut stream = self.open(source)?;
        let fingerprints = stream.by_ref().collect::<Result<Vec<_>>>()?;
        if stream.was_cancelled() {
            return Err(Error::Input(format!("extraction of {} cancelled", reference_id)));
        }
        self.state = RunnerState::Storing;
        write_item_dump(dir, reference_id, &fingerprints)
    }

    /// Match a long or endless stream window by window.
    pub fn monitor<S: SampleSource>(&mut self, source: S) -> Result<MonitorReports<'a, S>> {
        let stream = self.open(source)?;
        self.state = RunnerState::Matching;

        let frame_seconds = self.config.audio.frame_seconds();
        let window_frames =
            ((self.config.matcher.monitor_window_secs as f64 / frame_seconds).round() as u32).max(1);
        Ok(MonitorReports {
            stream,
            matcher: Matcher::new(self.index, &self.config.matcher),
            window_frames,
            window_start: 0,
            frame_seconds,
            held: None,
            in_window: 0,
            done: false,
        })
    }
}

/// Yields one [`WindowReport`] per `monitor_window_secs` of audio, with a
/// fresh vote for every window.
pub struct MonitorReports<'a, S> {
    stream: FingerprintStream<S>,
    matcher: Matcher<'a>,
    window_frames: u32,
    window_start: u32,
    frame_seconds: f64,
    held: Option<Fingerprint>,
    in_window: u64,
    done: bool,
}

impl<S: SampleSource> MonitorReports<'_, S> {
    fn close_window(&mut self) -> WindowReport {
        let report = WindowReport {
            start_secs: self.window_start as f64 * self.frame_seconds,
            fingerprints: self.in_window,
            results: self.matcher.results(),
        };
        self.matcher.reset();
        self.in_window = 0;
        self.window_start += self.window_frames;
        report
    }
}

impl<S: SampleSource> Iterator for MonitorReports<'_, S> {
    type Item = Result<WindowReport>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(fingerprint) = self.held.take() {
                if fingerprint.t1 >= self.window_start + self.window_frames {
                    self.held = Some(fingerprint);
                    return Some(Ok(self.close_window()));
                }
                self.matcher.add(&fingerprint);
                self.in_window += 1;
            }

            match self.stream.next() {
                Some(Ok(fingerprint)) => self.held = Some(fingerprint),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    return (self.in_window > 0).then(|| Ok(self.close_window()));
                }
            }
        }
    }
}
