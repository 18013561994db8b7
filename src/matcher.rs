//! Offset voting over index hits.
//!
//! Every hit of a query fingerprint votes for `(reference, ref_t1 - query_t1)`.
//! A true match piles its votes into one offset bin while chance collisions
//! scatter across many.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::config::MatcherConfig;
use crate::fingerprint::{with_time_delta, Fingerprint, MAX_TIME_DELTA};
use crate::storage::Index;

/// One ranked identification. Times are in seconds.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MatchResult {
    pub match_count: u32,
    pub query_start: f64,
    pub query_stop: f64,
    pub reference_id: u64,
    pub reference_start: f64,
    pub reference_stop: f64,
}

impl MatchResult {
    /// The row reported when nothing qualifies.
    pub fn no_match() -> Self {
        Self {
            match_count: 0,
            query_start: 0.0,
            query_stop: 0.0,
            reference_id: 0,
            reference_start: 0.0,
            reference_stop: 0.0,
        }
    }

    pub fn is_match(&self) -> bool {
        self.match_count > 0
    }
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {:.2}, {:.2}, {}, {:.2}, {:.2}",
            self.match_count,
            self.query_start,
            self.query_stop,
            self.reference_id,
            self.reference_start,
            self.reference_stop
        )
    }
}

/// Ranked results plus the counts needed to tell "no match" apart from
/// "nothing to match".
#[derive(Clone, Debug, Default, Serialize)]
pub struct QueryReport {
    pub results: Vec<MatchResult>,
    pub fingerprints: u64,
    pub hits: u64,
}

#[derive(Clone, Copy, Debug)]
struct Bucket {
    count: u32,
    query_first: u32,
    query_last: u32,
}

pub struct Matcher<'a> {
    index: &'a Index,
    config: MatcherConfig,
    frame_seconds: f64,
    // reference id -> offset -> votes
    buckets: HashMap<u64, HashMap<i64, Bucket>>,
    bucket_count: usize,
    // next bucket count that triggers a prune pass
    prune_at: usize,
    prune_passes: u64,
    excluded: Option<u64>,
    fingerprints: u64,
    hits: u64,
    latest_t1: u32,
    warned_collisions: bool,
}

impl<'a> Matcher<'a> {
    pub fn new(index: &'a Index, config: &MatcherConfig) -> Self {
        Self {
            index,
            config: config.clone(),
            frame_seconds: index.frame_seconds(),
            buckets: HashMap::new(),
            bucket_count: 0,
            prune_at: config.max_buckets,
            prune_passes: 0,
            excluded: None,
            fingerprints: 0,
            hits: 0,
            latest_t1: 0,
            warned_collisions: false,
        }
    }

    /// Ignore hits on `reference_id`, used when a reference queries the
    /// index it is stored in.
    pub fn exclude(mut self, reference_id: u64) -> Self {
        self.excluded = Some(reference_id);
        self
    }

    pub fn add(&mut self, fingerprint: &Fingerprint) {
        self.fingerprints += 1;
        self.latest_t1 = self.latest_t1.max(fingerprint.t1);

        self.probe(fingerprint.hash, fingerprint.t1);
        if self.config.include_off_by_one {
            let dt = fingerprint.time_delta();
            if dt > 1 {
                self.probe(with_time_delta(fingerprint.hash, dt - 1), fingerprint.t1);
            }
            if dt < MAX_TIME_DELTA {
                self.probe(with_time_delta(fingerprint.hash, dt + 1), fingerprint.t1);
            }
        }

        if self.bucket_count > self.prune_at {
            self.prune();
        }
    }

    fn probe(&mut self, hash: u32, query_t1: u32) {
        let mut occurrences = self.index.lookup(hash);
        if occurrences.len() > self.config.max_collisions {
            if !self.warned_collisions {
                log::warn!(
                    "hash {:#010x} has {} occurrences, only the first {} are used",
                    hash,
                    occurrences.len(),
                    self.config.max_collisions
                );
                self.warned_collisions = true;
            }
            occurrences.truncate(self.config.max_collisions);
        }

        for occurrence in occurrences {
            if self.excluded == Some(occurrence.reference_id) {
                continue;
            }
            self.hits += 1;
            let offset = occurrence.t1 as i64 - query_t1 as i64;
            let bins = self.buckets.entry(occurrence.reference_id).or_default();
            match bins.get_mut(&offset) {
                Some(bucket) => {
                    bucket.count += 1;
                    bucket.query_first = bucket.query_first.min(query_t1);
                    bucket.query_last = bucket.query_last.max(query_t1);
                }
                None => {
                    bins.insert(
                        offset,
                        Bucket {
                            count: 1,
                            query_first: query_t1,
                            query_last: query_t1,
                        },
                    );
                    self.bucket_count += 1;
                }
            }
        }
    }

    // Drop weak bins that have not been hit for max_result_age frames. The
    // next pass waits until the survivors have doubled.
    fn prune(&mut self) {
        let min_count = self.config.min_match_count;
        let horizon = self.latest_t1.saturating_sub(self.config.max_result_age);
        let before = self.bucket_count;

        self.buckets.retain(|_, bins| {
            bins.retain(|_, b| b.count >= min_count || b.query_last >= horizon);
            !bins.is_empty()
        });
        self.bucket_count = self.buckets.values().map(HashMap::len).sum();
        self.prune_at = self.config.max_buckets.max(self.bucket_count * 2);
        self.prune_passes += 1;
        log::debug!(
            "prune pass {}: dropped {} of {} offset bins",
            self.prune_passes,
            before - self.bucket_count,
            before
        );
    }

    /// Ranked results: best offset per reference, strongest first. Holds
    /// a single no-match row when nothing reaches `min_match_count`.
    pub fn results(&self) -> Vec<MatchResult> {
        let fs = self.frame_seconds;
        let mut results: Vec<MatchResult> = self
            .buckets
            .iter()
            .filter_map(|(&reference_id, bins)| {
                let (&offset, best) = bins
                    .iter()
                    .max_by(|a, b| a.1.count.cmp(&b.1.count).then(b.0.cmp(a.0)))?;
                if best.count < self.config.min_match_count {
                    return None;
                }
                let start = best.query_first as f64;
                let stop = best.query_last as f64;
                Some(MatchResult {
                    match_count: best.count,
                    query_start: start * fs,
                    query_stop: stop * fs,
                    reference_id,
                    reference_start: (start + offset as f64) * fs,
                    reference_stop: (stop + offset as f64) * fs,
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.match_count
                .cmp(&a.match_count)
                .then(a.reference_id.cmp(&b.reference_id))
        });
        results.truncate(self.config.max_results);
        if results.is_empty() {
            results.push(MatchResult::no_match());
        }
        results
    }

    pub fn report(&self) -> QueryReport {
        QueryReport {
            results: self.results(),
            fingerprints: self.fingerprints,
            hits: self.hits,
        }
    }

    /// Forget all votes, keeping the index and exclusion.
    pub fn reset(&mut self) {
        self.buckets.clear();
        self.bucket_count = 0;
        self.prune_at = self.config.max_buckets;
        self.fingerprints = 0;
        self.hits = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn fp(t1: u32, hash: u32) -> Fingerprint {
        Fingerprint {
            t1,
            f1: 30,
            t2: t1 + 5,
            f2: 40,
            hash: with_time_delta(hash << 6, 5),
            flags: 0,
        }
    }

    fn config(min_match_count: u32) -> MatcherConfig {
        MatcherConfig {
            min_match_count,
            ..MatcherConfig::default()
        }
    }

    fn query(index: &Index, config: &MatcherConfig, fingerprints: &[Fingerprint]) -> QueryReport {
        let mut matcher = Matcher::new(index, config);
        for fingerprint in fingerprints {
            matcher.add(fingerprint);
        }
        matcher.report()
    }

    #[test]
    fn votes_by_time_offset() {
        let index = Index::in_memory(&Config::default());
        index.insert(1, &[fp(10, 7)]).unwrap();

        let report = query(&index, &config(1), &[fp(4, 7)]);
        let result = &report.results[0];
        assert_eq!(result.match_count, 1);
        assert_eq!(result.reference_id, 1);
        // offset 10 - 4 = 6 frames
        assert!((result.reference_start - result.query_start - 6.0 * 0.032).abs() < 1e-9);
        assert!((result.query_start - 4.0 * 0.032).abs() < 1e-9);

        let stored: Vec<Fingerprint> = (0..20).map(|i| fp(10 + i, 100 + i)).collect();
        index.insert(2, &stored).unwrap();
        let mut previous = 0;
        for n in 1..=20 {
            let excerpt: Vec<Fingerprint> = (0..n).map(|i| fp(4 + i, 100 + i)).collect();
            let count = query(&index, &config(1), &excerpt).results[0].match_count;
            assert!(count > previous);
            previous = count;
        }
        assert_eq!(previous, 20);
    }

    #[test]
    fn empty_index_yields_single_no_match_row() {
        let index = Index::in_memory(&Config::default());
        let report = query(&index, &config(5), &[fp(1, 1), fp(2, 2)]);
        assert_eq!(report.results, vec![MatchResult::no_match()]);
        assert_eq!(report.fingerprints, 2);
        assert_eq!(report.hits, 0);

        let report = query(&index, &config(5), &[]);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.fingerprints, 0);
    }

    #[test]
    fn aligned_reference_beats_collisions() {
        let index = Index::in_memory(&Config::default());
        let song: Vec<Fingerprint> = (0..30).map(|i| fp(100 + i * 2, i)).collect();
        index.insert(1, &song).unwrap();
        // same hashes scattered in time for the second reference
        let noise: Vec<Fingerprint> = (0..30).map(|i| fp((i * 37) % 500, i)).collect();
        index.insert(2, &noise).unwrap();

        let excerpt: Vec<Fingerprint> = (5..25).map(|i| fp(i * 2, i)).collect();
        let report = query(&index, &config(5), &excerpt);
        assert_eq!(report.results.len(), 1);
        let best = &report.results[0];
        assert_eq!(best.reference_id, 1);
        assert_eq!(best.match_count, 20);
        assert_eq!(report.hits, 40);
    }

    #[test]
    fn excerpt_found_at_its_offset() {
        let index = Index::in_memory(&Config::default());
        // one minute of fingerprints each, disjoint hash sets
        let a: Vec<Fingerprint> = (0..1875).map(|i| fp(i, 1000 + i)).collect();
        let b: Vec<Fingerprint> = (0..1875).map(|i| fp(i, 100_000 + i)).collect();
        index.insert(0xA, &a).unwrap();
        index.insert(0xB, &b).unwrap();

        let shift = 938; // 30 s worth of frames
        let excerpt: Vec<Fingerprint> = a
            .iter()
            .filter(|f| f.t1 >= shift && f.t1 < shift + 312)
            .map(|f| Fingerprint { t1: f.t1 - shift, t2: f.t2 - shift, ..*f })
            .collect();

        let report = query(&index, &config(5), &excerpt);
        assert_eq!(report.results.len(), 1);
        let result = &report.results[0];
        assert_eq!(result.reference_id, 0xA);
        assert_eq!(result.match_count as usize, excerpt.len());
        assert!((result.reference_start - 30.0).abs() < 0.1);
        assert!(result.query_start.abs() < 1e-9);
    }

    #[test]
    fn ties_rank_by_reference_then_offset() {
        let index = Index::in_memory(&Config::default());
        let a: Vec<Fingerprint> = (0..6).map(|i| fp(50 + i, i)).collect();
        index.insert(9, &a).unwrap();
        index.insert(3, &a).unwrap();
        let report = query(&index, &config(5), &a);
        let ids: Vec<u64> = report.results.iter().map(|r| r.reference_id).collect();
        assert_eq!(ids, vec![3, 9]);

        // two bins of equal weight inside one reference: the smaller offset wins
        let index = Index::in_memory(&Config::default());
        let twice: Vec<Fingerprint> = (0..5)
            .flat_map(|i| [fp(20 + i, i), fp(80 + i, i)])
            .collect();
        index.insert(1, &twice).unwrap();
        let excerpt: Vec<Fingerprint> = (0..5).map(|i| fp(i, i)).collect();
        let best = &query(&index, &config(5), &excerpt).results[0];
        assert!((best.reference_start - 20.0 * 0.032).abs() < 1e-9);
    }

    #[test]
    fn exclusion_and_collision_cap() {
        let index = Index::in_memory(&Config::default());
        let song: Vec<Fingerprint> = (0..10).map(|i| fp(i, i)).collect();
        index.insert(1, &song).unwrap();
        index.insert(2, &song).unwrap();

        let mut matcher = Matcher::new(&index, &config(5)).exclude(1);
        for f in &song {
            matcher.add(f);
        }
        let results = matcher.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].reference_id, 2);

        let capped = MatcherConfig {
            max_collisions: 1,
            ..config(5)
        };
        let report = query(&index, &capped, &song);
        assert_eq!(report.hits, 10);
    }

    #[test]
    fn off_by_one_probes_neighbouring_deltas() {
        let index = Index::in_memory(&Config::default());
        let stored: Vec<Fingerprint> = (0..8).map(|i| fp(i * 3, i)).collect();
        index.insert(1, &stored).unwrap();

        // same peaks, but the second peak landed one frame late
        let late: Vec<Fingerprint> = stored
            .iter()
            .map(|f| Fingerprint {
                t2: f.t2 + 1,
                hash: with_time_delta(f.hash, 6),
                ..*f
            })
            .collect();
        assert_eq!(query(&index, &config(5), &late).results[0].match_count, 0);

        let tolerant = MatcherConfig {
            include_off_by_one: true,
            ..config(5)
        };
        assert_eq!(query(&index, &tolerant, &late).results[0].match_count, 8);
    }

    #[test]
    fn prunes_stale_weak_bins() {
        let index = Index::in_memory(&Config::default());
        let stored: Vec<Fingerprint> = (0..400).map(|i| fp(i, i)).collect();
        index.insert(1, &stored).unwrap();
        // scattered single hits that never line up
        index.insert(2, &(0..400).map(|i| fp(i * 7, i)).collect::<Vec<_>>()).unwrap();

        let cfg = MatcherConfig {
            max_buckets: 4,
            max_result_age: 10,
            ..config(5)
        };
        let mut matcher = Matcher::new(&index, &cfg);
        for f in &stored {
            matcher.add(f);
        }
        // survivors: the aligned bin plus the weak bins of the last 11 frames
        assert!(matcher.bucket_count <= 2 * (1 + 11));
        let results = matcher.results();
        assert_eq!(results[0].reference_id, 1);
        assert_eq!(results[0].match_count, 400);
    }

    #[test]
    fn pruning_backs_off_while_bins_survive() {
        let index = Index::in_memory(&Config::default());
        index.insert(2, &(0..400).map(|i| fp(i * 7, i)).collect::<Vec<_>>()).unwrap();

        // every bin already qualifies, so no pass can drop anything
        let cfg = MatcherConfig {
            max_buckets: 4,
            max_result_age: 10,
            ..config(1)
        };
        let mut matcher = Matcher::new(&index, &cfg);
        for i in 0..400 {
            matcher.add(&fp(i, i));
        }
        assert_eq!(matcher.bucket_count, 400);
        assert!(matcher.prune_passes <= 8, "{} passes", matcher.prune_passes);

        matcher.reset();
        assert_eq!(matcher.prune_at, 4);
    }

    #[test]
    fn result_line_format() {
        let result = MatchResult {
            match_count: 12,
            query_start: 1.0,
            query_stop: 3.456,
            reference_id: 77,
            reference_start: 31.0,
            reference_stop: 33.456,
        };
        assert_eq!(result.to_string(), "12, 1.00, 3.46, 77, 31.00, 33.46");
    }
}
