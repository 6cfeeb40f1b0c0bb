//! Key-aware sparse row cache with fingerprint tagging and LRU eviction.
//!
//! Rows are stored per [`SourceKey`] as contiguous segments in a `BTreeMap`
//! keyed by start row. Segments of one key never overlap and are merged with
//! touching neighbours on insert. Every segment carries the fingerprint it was
//! fetched under; a key holds rows for exactly one (active) fingerprint.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::windows::{gaps, intersect};
use crate::models::{CacheEntry, Fingerprint, Row, RowWindow, SourceKey};

struct Segment {
    end: u64,
    rows: Vec<Row>,
    fingerprint: Fingerprint,
    last_access: u64,
}

#[derive(Default)]
struct SourceSlot {
    active: Option<Fingerprint>,
    segments: BTreeMap<u64, Segment>,
    pinned: Option<Range<u64>>,
}

impl SourceSlot {
    /// Start rows of segments overlapping `span`, in ascending order.
    fn overlapping(&self, span: &Range<u64>) -> Vec<u64> {
        let mut starts: Vec<u64> = self
            .segments
            .range(..span.end)
            .rev()
            .take_while(|(_, seg)| seg.end > span.start)
            .map(|(start, _)| *start)
            .collect();
        starts.reverse();
        starts
    }

    /// Like `overlapping`, but also picks up segments ending exactly at
    /// `span.start` or starting exactly at `span.end`.
    fn touching(&self, span: &Range<u64>) -> Vec<u64> {
        let mut starts: Vec<u64> = self
            .segments
            .range(..=span.end)
            .rev()
            .take_while(|(_, seg)| seg.end >= span.start)
            .map(|(start, _)| *start)
            .collect();
        starts.reverse();
        starts
    }
}

/// Result of [`RowCache::get`].
#[derive(Clone, Debug, PartialEq)]
pub struct CacheLookup {
    pub hits: Vec<CacheEntry>,
    pub misses: Vec<RowWindow>,
}

impl CacheLookup {
    pub fn is_complete(&self) -> bool {
        self.misses.is_empty()
    }
}

/// Result of [`RowCache::put`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// Rows were merged in; `evicted` rows were dropped to respect the budget.
    Stored { rows: usize, evicted: usize },
    /// Fingerprint did not match the active descriptor; nothing changed.
    StaleWrite,
    /// The write carried no rows.
    Empty,
}

/// Point-in-time cache counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub sources: usize,
    pub entries: usize,
    pub cached_rows: usize,
    pub max_rows: usize,
    pub hit_rows: u64,
    pub miss_windows: u64,
    pub stale_writes: u64,
    pub evicted_rows: u64,
}

/// Sparse, range-addressable row store owned by one pipeline.
pub struct RowCache {
    max_rows: usize,
    slots: HashMap<SourceKey, SourceSlot>,
    total_rows: usize,
    tick: u64,
    hit_rows: u64,
    miss_windows: u64,
    stale_writes: u64,
    evicted_rows: u64,
}

impl RowCache {
    pub fn new(max_rows: usize) -> Self {
        Self {
            max_rows: max_rows.max(1),
            slots: HashMap::new(),
            total_rows: 0,
            tick: 0,
            hit_rows: 0,
            miss_windows: 0,
            stale_writes: 0,
            evicted_rows: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Descriptor binding
    // -----------------------------------------------------------------------

    /// Make `fingerprint` the only one accepted for `key`.
    ///
    /// Returns `true` when a different fingerprint was active and its rows
    /// were dropped.
    pub fn activate(&mut self, key: &SourceKey, fingerprint: &Fingerprint) -> bool {
        let slot = self.slots.entry(key.clone()).or_default();
        if slot.active.as_ref() == Some(fingerprint) {
            return false;
        }
        let had_active = slot.active.is_some();
        slot.active = Some(fingerprint.clone());
        let dropped: usize = slot.segments.values().map(|s| s.rows.len()).sum();
        slot.segments.clear();
        slot.pinned = None;
        self.total_rows -= dropped;
        if had_active {
            debug!(source = %key, fingerprint = %fingerprint, dropped, "cache rebound to new fingerprint");
        }
        had_active
    }

    pub fn active_fingerprint(&self, key: &SourceKey) -> Option<&Fingerprint> {
        self.slots.get(key).and_then(|slot| slot.active.as_ref())
    }

    /// Drop every entry for `key`. The active fingerprint is kept.
    pub fn invalidate(&mut self, key: &SourceKey) -> usize {
        let Some(slot) = self.slots.get_mut(key) else {
            return 0;
        };
        let dropped: usize = slot.segments.values().map(|s| s.rows.len()).sum();
        slot.segments.clear();
        self.total_rows -= dropped;
        debug!(source = %key, dropped, "cache invalidated");
        dropped
    }

    /// Forget `key` entirely, including its active fingerprint.
    pub fn remove_source(&mut self, key: &SourceKey) {
        if let Some(slot) = self.slots.remove(key) {
            let dropped: usize = slot.segments.values().map(|s| s.rows.len()).sum();
            self.total_rows -= dropped;
        }
    }

    /// Mark the window the grid currently needs; eviction never touches it.
    pub fn pin(&mut self, key: &SourceKey, span: Option<Range<u64>>) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.pinned = span.filter(|s| s.start < s.end);
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Split `window` into cached hits and maximal uncached gaps.
    pub fn get(&mut self, key: &SourceKey, window: &RowWindow) -> CacheLookup {
        self.tick += 1;
        let tick = self.tick;
        let span = window.span();
        let mut hits = Vec::new();
        let mut covered: Vec<Range<u64>> = Vec::new();

        if let Some(slot) = self.slots.get_mut(key) {
            for start in slot.overlapping(&span) {
                let Some(seg) = slot.segments.get_mut(&start) else {
                    continue;
                };
                seg.last_access = tick;
                let seg_span = start..seg.end;
                if let Some(part) = intersect(&seg_span, &span) {
                    let lo = (part.start - start) as usize;
                    let hi = (part.end - start) as usize;
                    hits.push(CacheEntry {
                        window: RowWindow::from_span(key, part.clone()),
                        rows: seg.rows[lo..hi].to_vec(),
                        fingerprint: seg.fingerprint.clone(),
                    });
                    covered.push(part);
                }
            }
        }

        let misses: Vec<RowWindow> = gaps(&covered, &span)
            .into_iter()
            .map(|gap| RowWindow::from_span(key, gap))
            .collect();

        self.hit_rows += covered.iter().map(|c| c.end - c.start).sum::<u64>();
        self.miss_windows += misses.len() as u64;
        CacheLookup { hits, misses }
    }

    /// Uncached gaps of `window` without touching LRU order or counters.
    pub fn missing(&self, key: &SourceKey, window: &RowWindow) -> Vec<RowWindow> {
        let span = window.span();
        let covered: Vec<Range<u64>> = match self.slots.get(key) {
            Some(slot) => slot
                .overlapping(&span)
                .into_iter()
                .filter_map(|start| slot.segments.get(&start).map(|seg| start..seg.end))
                .collect(),
            None => Vec::new(),
        };
        gaps(&covered, &span)
            .into_iter()
            .map(|gap| RowWindow::from_span(key, gap))
            .collect()
    }

    /// Borrow a single cached row.
    pub fn row(&self, key: &SourceKey, index: u64) -> Option<&Row> {
        let slot = self.slots.get(key)?;
        let (start, seg) = slot.segments.range(..=index).next_back()?;
        if index < seg.end {
            seg.rows.get((index - start) as usize)
        } else {
            None
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Merge `rows` starting at `window.start` into the cache.
    ///
    /// `rows` may be shorter than the window (the source ended early); extra
    /// rows beyond the window are ignored.
    pub fn put(
        &mut self,
        key: &SourceKey,
        window: &RowWindow,
        mut rows: Vec<Row>,
        fingerprint: &Fingerprint,
    ) -> PutOutcome {
        let Some(slot) = self.slots.get_mut(key) else {
            self.stale_writes += 1;
            return PutOutcome::StaleWrite;
        };
        if slot.active.as_ref() != Some(fingerprint) {
            self.stale_writes += 1;
            debug!(source = %key, fingerprint = %fingerprint, "stale cache write ignored");
            return PutOutcome::StaleWrite;
        }
        rows.truncate(window.len() as usize);
        if rows.is_empty() {
            return PutOutcome::Empty;
        }

        self.tick += 1;
        let start = window.start;
        let end = start + rows.len() as u64;
        let stored = rows.len();
        let touching = slot.touching(&(start..end));

        let mut merged_start = start;
        let mut prefix: Vec<Row> = Vec::new();
        let mut suffix: Vec<Row> = Vec::new();
        let mut removed = 0usize;
        for seg_start in touching {
            let Some(seg) = slot.segments.remove(&seg_start) else {
                continue;
            };
            removed += seg.rows.len();
            let mut seg_rows = seg.rows;
            // A segment can extend past both ends of the write.
            if seg.end > end {
                suffix = seg_rows.split_off((end - seg_start) as usize);
            }
            if seg_start < start {
                merged_start = seg_start;
                seg_rows.truncate((start - seg_start) as usize);
                prefix = seg_rows;
            }
        }

        let mut merged = prefix;
        merged.extend(rows);
        merged.extend(suffix);
        let merged_end = merged_start + merged.len() as u64;
        let merged_len = merged.len();
        slot.segments.insert(
            merged_start,
            Segment {
                end: merged_end,
                rows: merged,
                fingerprint: fingerprint.clone(),
                last_access: self.tick,
            },
        );
        self.total_rows = self.total_rows - removed + merged_len;
        debug!(
            source = %key,
            start,
            end,
            merged_start,
            merged_end,
            cached_rows = self.total_rows,
            "rows cached"
        );

        let evicted = self.evict();
        PutOutcome::Stored {
            rows: stored,
            evicted,
        }
    }

    /// Drop cached rows at or beyond `total` (the source shrank).
    pub fn truncate(&mut self, key: &SourceKey, total: u64) -> usize {
        let Some(slot) = self.slots.get_mut(key) else {
            return 0;
        };
        let mut dropped = 0usize;
        let doomed: Vec<u64> = slot.segments.range(total..).map(|(s, _)| *s).collect();
        for start in doomed {
            if let Some(seg) = slot.segments.remove(&start) {
                dropped += seg.rows.len();
            }
        }
        if let Some((start, seg)) = slot.segments.range_mut(..total).next_back() {
            if seg.end > total {
                let keep = (total - start) as usize;
                dropped += seg.rows.len() - keep;
                seg.rows.truncate(keep);
                seg.end = total;
            }
        }
        self.total_rows -= dropped;
        dropped
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    /// Evict least-recently-accessed segments until the row budget holds.
    ///
    /// A segment straddling its source's pinned window is trimmed down to the
    /// pinned part instead of being removed.
    fn evict(&mut self) -> usize {
        let mut evicted = 0usize;
        while self.total_rows > self.max_rows {
            let mut victim: Option<(SourceKey, u64, u64)> = None;
            for (key, slot) in &self.slots {
                for (start, seg) in &slot.segments {
                    let protected = slot
                        .pinned
                        .as_ref()
                        .is_some_and(|p| p.start <= *start && seg.end <= p.end);
                    if protected {
                        continue;
                    }
                    let older = victim
                        .as_ref()
                        .map_or(true, |(_, _, access)| seg.last_access < *access);
                    if older {
                        victim = Some((key.clone(), *start, seg.last_access));
                    }
                }
            }

            let Some((key, start, _)) = victim else {
                warn!(
                    cached_rows = self.total_rows,
                    max_rows = self.max_rows,
                    "row budget exceeded by pinned windows"
                );
                break;
            };
            let Some(slot) = self.slots.get_mut(&key) else {
                break;
            };
            let Some(seg) = slot.segments.remove(&start) else {
                break;
            };
            let seg_span = start..seg.end;
            let kept = slot.pinned.as_ref().and_then(|p| intersect(p, &seg_span));
            let before = seg.rows.len();
            match kept {
                Some(part) => {
                    let lo = (part.start - start) as usize;
                    let hi = (part.end - start) as usize;
                    let rows: Vec<Row> = seg.rows.into_iter().skip(lo).take(hi - lo).collect();
                    let kept_len = rows.len();
                    slot.segments.insert(
                        part.start,
                        Segment {
                            end: part.end,
                            rows,
                            fingerprint: seg.fingerprint,
                            last_access: seg.last_access,
                        },
                    );
                    evicted += before - kept_len;
                    self.total_rows -= before - kept_len;
                }
                None => {
                    evicted += before;
                    self.total_rows -= before;
                }
            }
            debug!(source = %key, start, "evicted cache window");
        }
        self.evicted_rows += evicted as u64;
        evicted
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Cached windows for `key`, ascending.
    pub fn windows(&self, key: &SourceKey) -> Vec<RowWindow> {
        self.slots
            .get(key)
            .map(|slot| {
                slot.segments
                    .iter()
                    .map(|(start, seg)| RowWindow::new(key.clone(), *start, seg.end))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn cached_rows(&self) -> usize {
        self.total_rows
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            sources: self.slots.len(),
            entries: self.slots.values().map(|s| s.segments.len()).sum(),
            cached_rows: self.total_rows,
            max_rows: self.max_rows,
            hit_rows: self.hit_rows,
            miss_windows: self.miss_windows,
            stale_writes: self.stale_writes,
            evicted_rows: self.evicted_rows,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> SourceKey {
        SourceKey::new("df")
    }

    fn fp(s: &str) -> Fingerprint {
        Fingerprint(s.to_string())
    }

    fn window(start: u64, end: u64) -> RowWindow {
        RowWindow::new(key(), start, end)
    }

    fn rows(start: u64, end: u64) -> Vec<Row> {
        (start..end)
            .map(|i| {
                let mut row = Row::new();
                row.insert("row_num".into(), json!(i));
                row
            })
            .collect()
    }

    fn active_cache(max_rows: usize) -> RowCache {
        let mut cache = RowCache::new(max_rows);
        cache.activate(&key(), &fp("f1"));
        cache
    }

    #[test]
    fn test_get_on_empty_cache_is_single_miss() {
        let mut cache = active_cache(100);
        let lookup = cache.get(&key(), &window(10, 20));
        assert!(lookup.hits.is_empty());
        assert_eq!(lookup.misses, vec![window(10, 20)]);
    }

    #[test]
    fn test_get_on_unknown_key_is_miss() {
        let mut cache = RowCache::new(100);
        let lookup = cache.get(&SourceKey::new("nope"), &RowWindow::new("nope".into(), 0, 5));
        assert_eq!(lookup.misses.len(), 1);
    }

    #[test]
    fn test_put_then_get_hits_and_gaps() {
        let mut cache = active_cache(100);
        cache.put(&key(), &window(10, 20), rows(10, 20), &fp("f1"));
        cache.put(&key(), &window(30, 40), rows(30, 40), &fp("f1"));

        let lookup = cache.get(&key(), &window(0, 50));
        assert_eq!(
            lookup.misses,
            vec![window(0, 10), window(20, 30), window(40, 50)]
        );
        assert_eq!(lookup.hits.len(), 2);
        assert_eq!(lookup.hits[0].window, window(10, 20));
        assert_eq!(lookup.hits[0].rows[0]["row_num"], json!(10));
        assert_eq!(lookup.hits[1].rows.len(), 10);
    }

    #[test]
    fn test_get_is_idempotent() {
        let mut cache = active_cache(100);
        cache.put(&key(), &window(5, 15), rows(5, 15), &fp("f1"));
        let first = cache.get(&key(), &window(0, 20));
        let second = cache.get(&key(), &window(0, 20));
        assert_eq!(first, second);
    }

    #[test]
    fn test_adjacent_puts_merge_into_one_entry() {
        let mut cache = active_cache(100);
        cache.put(&key(), &window(0, 10), rows(0, 10), &fp("f1"));
        cache.put(&key(), &window(10, 20), rows(10, 20), &fp("f1"));
        assert_eq!(cache.windows(&key()), vec![window(0, 20)]);
        assert_eq!(cache.cached_rows(), 20);
    }

    #[test]
    fn test_overlapping_put_prefers_new_rows() {
        let mut cache = active_cache(100);
        cache.put(&key(), &window(0, 10), rows(0, 10), &fp("f1"));
        cache.put(&key(), &window(20, 30), rows(20, 30), &fp("f1"));

        let mut fresh = rows(5, 25);
        for row in &mut fresh {
            row.insert("fresh".into(), json!(true));
        }
        cache.put(&key(), &window(5, 25), fresh, &fp("f1"));

        assert_eq!(cache.windows(&key()), vec![window(0, 30)]);
        assert_eq!(cache.cached_rows(), 30);
        assert!(cache.row(&key(), 4).unwrap().get("fresh").is_none());
        assert_eq!(cache.row(&key(), 5).unwrap()["fresh"], json!(true));
        assert_eq!(cache.row(&key(), 24).unwrap()["row_num"], json!(24));
        assert!(cache.row(&key(), 25).unwrap().get("fresh").is_none());
        assert_eq!(cache.row(&key(), 29).unwrap()["row_num"], json!(29));
        assert!(cache.row(&key(), 30).is_none());
    }

    #[test]
    fn test_put_bridging_many_segments() {
        let mut cache = active_cache(1000);
        for s in [0u64, 20, 40, 60] {
            cache.put(&key(), &window(s, s + 10), rows(s, s + 10), &fp("f1"));
        }
        cache.put(&key(), &window(5, 65), rows(5, 65), &fp("f1"));
        assert_eq!(cache.windows(&key()), vec![window(0, 70)]);
        assert_eq!(cache.cached_rows(), 70);
        for i in 0..70 {
            assert_eq!(cache.row(&key(), i).unwrap()["row_num"], json!(i));
        }
    }

    #[test]
    fn test_put_inside_existing_segment_keeps_both_ends() {
        let mut cache = active_cache(100);
        cache.put(&key(), &window(0, 30), rows(0, 30), &fp("f1"));
        let mut fresh = rows(10, 20);
        for row in &mut fresh {
            row.insert("fresh".into(), json!(true));
        }
        cache.put(&key(), &window(10, 20), fresh, &fp("f1"));
        assert_eq!(cache.windows(&key()), vec![window(0, 30)]);
        assert_eq!(cache.cached_rows(), 30);
        assert!(cache.row(&key(), 9).unwrap().get("fresh").is_none());
        assert_eq!(cache.row(&key(), 15).unwrap()["fresh"], json!(true));
        assert_eq!(cache.row(&key(), 29).unwrap()["row_num"], json!(29));
    }

    #[test]
    fn test_stale_write_rejected_and_counted() {
        let mut cache = active_cache(100);
        let outcome = cache.put(&key(), &window(0, 5), rows(0, 5), &fp("old"));
        assert_eq!(outcome, PutOutcome::StaleWrite);
        assert_eq!(cache.cached_rows(), 0);
        assert_eq!(cache.stats().stale_writes, 1);
    }

    #[test]
    fn test_short_response_caches_only_returned_rows() {
        let mut cache = active_cache(100);
        cache.put(&key(), &window(90, 120), rows(90, 100), &fp("f1"));
        assert_eq!(cache.windows(&key()), vec![window(90, 100)]);
    }

    #[test]
    fn test_activate_new_fingerprint_drops_rows() {
        let mut cache = active_cache(100);
        cache.put(&key(), &window(0, 10), rows(0, 10), &fp("f1"));
        assert!(!cache.activate(&key(), &fp("f1")));
        assert_eq!(cache.cached_rows(), 10);
        assert!(cache.activate(&key(), &fp("f2")));
        assert_eq!(cache.cached_rows(), 0);
        assert_eq!(cache.active_fingerprint(&key()), Some(&fp("f2")));
    }

    #[test]
    fn test_invalidate_only_touches_one_key() {
        let mut cache = active_cache(100);
        let other = SourceKey::new("summary");
        cache.activate(&other, &fp("s1"));
        cache.put(&key(), &window(0, 10), rows(0, 10), &fp("f1"));
        cache.put(&other, &RowWindow::new(other.clone(), 0, 3), rows(0, 3), &fp("s1"));
        assert_eq!(cache.invalidate(&key()), 10);
        assert_eq!(cache.cached_rows(), 3);
        assert!(cache.row(&other, 2).is_some());
    }

    #[test]
    fn test_lru_eviction_drops_oldest_window() {
        let mut cache = active_cache(20);
        cache.put(&key(), &window(0, 10), rows(0, 10), &fp("f1"));
        cache.put(&key(), &window(100, 110), rows(100, 110), &fp("f1"));
        // Touch the first window so the second becomes least recent.
        cache.get(&key(), &window(0, 10));
        let outcome = cache.put(&key(), &window(200, 210), rows(200, 210), &fp("f1"));
        assert_eq!(outcome, PutOutcome::Stored { rows: 10, evicted: 10 });
        assert_eq!(cache.windows(&key()), vec![window(0, 10), window(200, 210)]);
        assert_eq!(cache.stats().evicted_rows, 10);
    }

    #[test]
    fn test_eviction_never_drops_pinned_window() {
        let mut cache = active_cache(20);
        cache.put(&key(), &window(0, 10), rows(0, 10), &fp("f1"));
        cache.pin(&key(), Some(0..10));
        cache.put(&key(), &window(100, 110), rows(100, 110), &fp("f1"));
        cache.put(&key(), &window(200, 210), rows(200, 210), &fp("f1"));
        // Window 0..10 is the oldest but pinned; 100..110 goes instead.
        assert_eq!(cache.windows(&key()), vec![window(0, 10), window(200, 210)]);
    }

    #[test]
    fn test_eviction_trims_segment_straddling_pin() {
        let mut cache = active_cache(30);
        cache.put(&key(), &window(0, 30), rows(0, 30), &fp("f1"));
        cache.pin(&key(), Some(10..20));
        cache.put(&key(), &window(50, 60), rows(50, 60), &fp("f1"));
        assert_eq!(cache.windows(&key()), vec![window(10, 20), window(50, 60)]);
        assert_eq!(cache.row(&key(), 10).unwrap()["row_num"], json!(10));
        assert_eq!(cache.cached_rows(), 20);
    }

    #[test]
    fn test_truncate_after_source_shrinks() {
        let mut cache = active_cache(100);
        cache.put(&key(), &window(0, 10), rows(0, 10), &fp("f1"));
        cache.put(&key(), &window(20, 30), rows(20, 30), &fp("f1"));
        assert_eq!(cache.truncate(&key(), 5), 15);
        assert_eq!(cache.windows(&key()), vec![window(0, 5)]);
        assert_eq!(cache.cached_rows(), 5);
    }

    #[test]
    fn test_missing_does_not_count() {
        let mut cache = active_cache(100);
        cache.put(&key(), &window(0, 10), rows(0, 10), &fp("f1"));
        assert_eq!(cache.missing(&key(), &window(0, 15)), vec![window(10, 15)]);
        assert_eq!(cache.stats().miss_windows, 0);
    }
}
