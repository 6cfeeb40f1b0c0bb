//! Half-open interval helpers shared by the cache and the coordinator.

use std::ops::Range;

/// Intersection of two spans, or `None` when they do not overlap.
pub fn intersect(a: &Range<u64>, b: &Range<u64>) -> Option<Range<u64>> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    (start < end).then_some(start..end)
}

/// True when the spans share at least one row or sit end-to-start.
pub fn touches(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start <= b.end && b.start <= a.end
}

/// Maximal sub-spans of `target` not covered by `covered`.
///
/// `covered` must be sorted by start and non-overlapping. Adjacent gaps are
/// never emitted separately, so the result is the minimal set of requests.
pub fn gaps<'a, I>(covered: I, target: &Range<u64>) -> Vec<Range<u64>>
where
    I: IntoIterator<Item = &'a Range<u64>>,
{
    let mut out = Vec::new();
    if target.start >= target.end {
        return out;
    }
    let mut cursor = target.start;
    for span in covered {
        if span.end <= cursor {
            continue;
        }
        if span.start >= target.end {
            break;
        }
        if span.start > cursor {
            out.push(cursor..span.start);
        }
        cursor = cursor.max(span.end);
        if cursor >= target.end {
            break;
        }
    }
    if cursor < target.end {
        out.push(cursor..target.end);
    }
    out
}

/// Cut a span into consecutive pieces of at most `max_len` rows.
pub fn split_span(span: Range<u64>, max_len: u64) -> Vec<Range<u64>> {
    let max_len = max_len.max(1);
    let mut out = Vec::new();
    let mut start = span.start;
    while start < span.end {
        let end = span.end.min(start.saturating_add(max_len));
        out.push(start..end);
        start = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaps_empty_cover() {
        assert_eq!(gaps(&[], &(0..10)), vec![0..10]);
    }

    #[test]
    fn test_gaps_merge_adjacent_holes() {
        // Two touching covered spans must not split the hole behind them.
        let covered = [0..5, 5..8, 20..30];
        assert_eq!(gaps(&covered, &(0..40)), vec![8..20, 30..40]);
    }

    #[test]
    fn test_gaps_fully_covered() {
        let covered = [0..100];
        assert!(gaps(&covered, &(10..90)).is_empty());
    }

    #[test]
    fn test_gaps_cover_outside_target_ignored() {
        let covered = [0..5, 50..60, 200..300];
        assert_eq!(gaps(&covered, &(10..100)), vec![10..50, 60..100]);
    }

    #[test]
    fn test_gaps_empty_target() {
        assert!(gaps(&[], &(7..7)).is_empty());
    }

    #[test]
    fn test_split_span() {
        assert_eq!(split_span(0..10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(split_span(3..3, 4), Vec::<Range<u64>>::new());
        assert_eq!(split_span(0..2, 0), vec![0..1, 1..2]);
    }

    #[test]
    fn test_intersect_and_touches() {
        assert_eq!(intersect(&(0..10), &(5..20)), Some(5..10));
        assert_eq!(intersect(&(0..10), &(10..20)), None);
        assert!(touches(&(0..10), &(10..20)));
        assert!(!touches(&(0..10), &(11..20)));
    }
}
