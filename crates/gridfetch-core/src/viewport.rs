//! Viewport request translator.
//!
//! Turns the grid's reported visible rows into a prefetch-padded target
//! window, looks it up in the cache and hands each uncached gap to the fetch
//! coordinator. Viewport notifications are debounced so that a fast scroll
//! only translates the position it settles on.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::RowCache;
use crate::errors::GridError;
use crate::fetch::{FetchCoordinator, FetchHandle, RowDecoder, Transport};
use crate::models::{Fingerprint, RowWindow, SourceKey, TotalRows, Viewport};

/// Where a viewport lands once padded and clamped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Window(RowWindow),
    /// The source has no rows at all.
    Empty,
    /// The viewport lies past the known end of the source.
    OutOfRange { start: u64, end: u64, total: u64 },
}

/// Outcome of translating one settled viewport.
#[derive(Debug)]
pub struct Translation {
    pub target: Target,
    pub hit_rows: u64,
    pub misses: Vec<RowWindow>,
    pub handles: Vec<FetchHandle>,
    /// Misses skipped because they already failed too often.
    pub blocked: Vec<RowWindow>,
    pub error: Option<GridError>,
}

impl Translation {
    fn idle(target: Target) -> Self {
        Self {
            target,
            hit_rows: 0,
            misses: Vec::new(),
            handles: Vec::new(),
            blocked: Vec::new(),
            error: None,
        }
    }

    pub fn issued_requests(&self) -> usize {
        self.handles.iter().map(|h| h.issued.len()).sum()
    }
}

/// Failures in a row, across windows, after which a whole source is left
/// alone; a multiple of the per-window attempts.
const SOURCE_STREAK_FACTOR: u32 = 4;

/// Caps how often a failing window, or a failing source, is asked for again.
#[derive(Debug, Default)]
pub struct RetryBudget {
    max_attempts: u32,
    failures: HashMap<RowWindow, u32>,
    /// Consecutive failures per source with no successful fetch between.
    streaks: HashMap<SourceKey, u32>,
}

impl RetryBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            failures: HashMap::new(),
            streaks: HashMap::new(),
        }
    }

    pub fn record_failure(&mut self, window: &RowWindow) -> u32 {
        *self.streaks.entry(window.source_key.clone()).or_insert(0) += 1;
        let attempts = self.failures.entry(window.clone()).or_insert(0);
        *attempts += 1;
        *attempts
    }

    /// A fetch for `key` succeeded; its failure streak starts over.
    pub fn record_success(&mut self, key: &SourceKey) {
        self.streaks.remove(key);
    }

    fn source_limit(&self) -> u32 {
        self.max_attempts.saturating_mul(SOURCE_STREAK_FACTOR)
    }

    /// True once `key` has failed too many times in a row, whatever the
    /// windows were.
    pub fn source_exhausted(&self, key: &SourceKey) -> bool {
        self.streaks
            .get(key)
            .is_some_and(|streak| *streak >= self.source_limit())
    }

    /// False when `window` overlaps a window that exhausted its attempts,
    /// or its source is exhausted.
    pub fn allows(&self, window: &RowWindow) -> bool {
        if self.source_exhausted(&window.source_key) {
            return false;
        }
        !self.failures.iter().any(|(failed, attempts)| {
            *attempts >= self.max_attempts
                && failed.source_key == window.source_key
                && failed.start < window.end
                && window.start < failed.end
        })
    }

    pub fn clear(&mut self) {
        self.failures.clear();
        self.streaks.clear();
    }

    pub fn clear_source(&mut self, key: &SourceKey) {
        self.failures.retain(|w, _| &w.source_key != key);
        self.streaks.remove(key);
    }
}

pub struct ViewportTranslator {
    margin: u64,
    debounce: Duration,
    pending: Option<(Viewport, Instant)>,
    settled: Option<Viewport>,
}

impl ViewportTranslator {
    pub fn new(margin: u64, debounce: Duration) -> Self {
        Self {
            margin,
            debounce,
            pending: None,
            settled: None,
        }
    }

    // -----------------------------------------------------------------------
    // Debounce
    // -----------------------------------------------------------------------

    /// Note a viewport report; it settles once `debounce` passes without a
    /// newer one.
    pub fn notify(&mut self, viewport: Viewport, now: Instant) {
        self.pending = Some((viewport, now + self.debounce));
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|(_, at)| at)
    }

    /// Return the pending viewport if its quiet period has elapsed.
    pub fn take_settled(&mut self, now: Instant) -> Option<Viewport> {
        match self.pending {
            Some((viewport, at)) if now >= at => {
                self.pending = None;
                self.settled = Some(viewport);
                Some(viewport)
            }
            _ => None,
        }
    }

    /// Accept a viewport immediately, dropping any pending one.
    pub fn settle(&mut self, viewport: Viewport) {
        self.pending = None;
        self.settled = Some(viewport);
    }

    /// Last settled viewport.
    pub fn current(&self) -> Option<Viewport> {
        self.settled
    }

    // -----------------------------------------------------------------------
    // Translation
    // -----------------------------------------------------------------------

    /// Pad the viewport by the prefetch margin and clamp it to the source.
    ///
    /// With an unknown row count the padded window is returned unclamped.
    pub fn target(&self, key: &SourceKey, viewport: Viewport, total: TotalRows) -> Target {
        let start = viewport.first_visible_row.saturating_sub(self.margin);
        let end = viewport
            .last_visible_row
            .saturating_add(self.margin)
            .saturating_add(1);
        match total {
            TotalRows::Unknown => Target::Window(RowWindow::new(key.clone(), start, end)),
            TotalRows::Known(0) => Target::Empty,
            TotalRows::Known(n) if start >= n => Target::OutOfRange { start, end, total: n },
            TotalRows::Known(n) => Target::Window(RowWindow::new(key.clone(), start, end.min(n))),
        }
    }

    /// Look the target window up in the cache and request every miss.
    #[allow(clippy::too_many_arguments)]
    pub fn translate<T: Transport, D: RowDecoder>(
        &self,
        key: &SourceKey,
        fingerprint: &Fingerprint,
        viewport: Viewport,
        total: TotalRows,
        cache: &mut RowCache,
        coordinator: &mut FetchCoordinator<T, D>,
        budget: &RetryBudget,
    ) -> Translation {
        let target = self.target(key, viewport, total);
        let window = match &target {
            Target::Window(w) => w.clone(),
            Target::Empty => {
                cache.pin(key, None);
                return Translation::idle(target);
            }
            Target::OutOfRange { start, end, total } => {
                debug!(source = %key, start, end, total, "viewport beyond source end");
                cache.pin(key, None);
                return Translation::idle(target);
            }
        };

        cache.pin(key, Some(window.span()));
        let lookup = cache.get(key, &window);
        let mut translation = Translation::idle(target);
        translation.hit_rows = lookup.hits.iter().map(|h| h.window.len()).sum();

        for miss in lookup.misses {
            if !budget.allows(&miss) {
                translation.blocked.push(miss);
                continue;
            }
            match coordinator.request(&miss, fingerprint) {
                Ok(handle) => translation.handles.push(handle),
                Err(err) => {
                    warn!(window = %miss, error = %err, "viewport fetch not issued");
                    translation.misses.push(miss);
                    translation.error = Some(err);
                    break;
                }
            }
            translation.misses.push(miss);
        }
        translation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GridResult;
    use crate::fetch::{ColumnarCodec, FetchRequest};
    use crate::models::Row;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<FetchRequest>>>);

    impl Transport for Sink {
        fn send(&self, request: &FetchRequest) -> GridResult<()> {
            self.0.lock().push(request.clone());
            Ok(())
        }
    }

    fn key() -> SourceKey {
        SourceKey::new("df")
    }

    fn fp() -> Fingerprint {
        Fingerprint("f1".into())
    }

    fn translator(margin: u64) -> ViewportTranslator {
        ViewportTranslator::new(margin, Duration::from_millis(50))
    }

    #[test]
    fn test_target_pads_and_clamps() {
        let t = translator(10);
        assert_eq!(
            t.target(&key(), Viewport::new(5, 20), TotalRows::Known(25)),
            Target::Window(RowWindow::new(key(), 0, 25))
        );
        assert_eq!(
            t.target(&key(), Viewport::new(100, 120), TotalRows::Known(1000)),
            Target::Window(RowWindow::new(key(), 90, 131))
        );
    }

    #[test]
    fn test_unknown_total_is_not_clamped() {
        let t = translator(10);
        assert_eq!(
            t.target(&key(), Viewport::new(100, 120), TotalRows::Unknown),
            Target::Window(RowWindow::new(key(), 90, 131))
        );
    }

    #[test]
    fn test_empty_and_out_of_range() {
        let t = translator(10);
        assert_eq!(t.target(&key(), Viewport::new(0, 30), TotalRows::Known(0)), Target::Empty);
        assert!(matches!(
            t.target(&key(), Viewport::new(500, 520), TotalRows::Known(100)),
            Target::OutOfRange { total: 100, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_only_settles_last_viewport() {
        let mut t = translator(0);
        let start = Instant::now();
        t.notify(Viewport::new(0, 10), start);
        t.notify(Viewport::new(10, 20), start + Duration::from_millis(20));
        t.notify(Viewport::new(40, 50), start + Duration::from_millis(40));

        assert_eq!(t.take_settled(start + Duration::from_millis(60)), None);
        assert_eq!(t.deadline(), Some(start + Duration::from_millis(90)));
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(t.take_settled(Instant::now()), Some(Viewport::new(40, 50)));
        assert_eq!(t.take_settled(Instant::now()), None);
        assert_eq!(t.current(), Some(Viewport::new(40, 50)));
    }

    #[test]
    fn test_translate_requests_only_misses() {
        let t = translator(0);
        let sink = Sink::default();
        let mut cache = RowCache::new(1000);
        cache.activate(&key(), &fp());
        let rows: Vec<Row> = (0..10)
            .map(|i| {
                let mut r = Row::new();
                r.insert("row_num".into(), json!(i));
                r
            })
            .collect();
        cache.put(&key(), &RowWindow::new(key(), 0, 10), rows, &fp());
        let mut coord = FetchCoordinator::new(sink.clone(), ColumnarCodec, None);

        let tr = t.translate(
            &key(),
            &fp(),
            Viewport::new(0, 29),
            TotalRows::Known(100),
            &mut cache,
            &mut coord,
            &RetryBudget::new(2),
        );
        assert_eq!(tr.hit_rows, 10);
        assert_eq!(tr.misses, vec![RowWindow::new(key(), 10, 30)]);
        assert_eq!(tr.issued_requests(), 1);
        assert_eq!(sink.0.lock()[0].range, [10, 30]);
    }

    #[test]
    fn test_translate_empty_source_issues_nothing() {
        let t = translator(50);
        let sink = Sink::default();
        let mut cache = RowCache::new(1000);
        cache.activate(&key(), &fp());
        let mut coord = FetchCoordinator::new(sink.clone(), ColumnarCodec, None);
        let tr = t.translate(
            &key(),
            &fp(),
            Viewport::new(0, 20),
            TotalRows::Known(0),
            &mut cache,
            &mut coord,
            &RetryBudget::new(2),
        );
        assert_eq!(tr.target, Target::Empty);
        assert!(sink.0.lock().is_empty());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_retry_budget_blocks_after_max_attempts() {
        let mut budget = RetryBudget::new(2);
        let w = RowWindow::new(key(), 0, 10);
        assert!(budget.allows(&w));
        budget.record_failure(&w);
        assert!(budget.allows(&w));
        budget.record_failure(&w);
        assert!(!budget.allows(&w));
        assert!(!budget.allows(&RowWindow::new(key(), 5, 15)));
        assert!(budget.allows(&RowWindow::new(key(), 10, 20)));
        budget.clear_source(&key());
        assert!(budget.allows(&w));
    }

    #[test]
    fn test_retry_budget_blocks_source_after_failure_streak() {
        let mut budget = RetryBudget::new(2);
        // Each shifted window fails once, so no single window is exhausted.
        for step in 0..7u64 {
            budget.record_failure(&RowWindow::new(key(), step * 3, step * 3 + 10));
        }
        assert!(budget.allows(&RowWindow::new(key(), 500, 510)));
        budget.record_failure(&RowWindow::new(key(), 21, 31));
        assert!(budget.source_exhausted(&key()));
        assert!(!budget.allows(&RowWindow::new(key(), 500, 510)));
        assert!(budget.allows(&RowWindow::new("other".into(), 0, 10)));

        budget.record_success(&key());
        assert!(budget.allows(&RowWindow::new(key(), 500, 510)));
    }
}
