//! Shared typed models used across the cache, fetch and transcript layers.

use std::fmt;
use std::ops::Range;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// One grid row: column name to cell value, in column order.
pub type Row = IndexMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Identity tokens
// ---------------------------------------------------------------------------

/// Identifies a logical dataset (for example a dataframe handle).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(pub String);

impl SourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Hash of every parameter that affects row content.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-assigned correlation id for one wire request.
pub type RequestId = u64;

// ---------------------------------------------------------------------------
// Row counts and windows
// ---------------------------------------------------------------------------

/// Total row count of a source; unknown while the source is still resolving.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TotalRows {
    #[default]
    Unknown,
    Known(u64),
}

impl TotalRows {
    pub fn known(self) -> Option<u64> {
        match self {
            TotalRows::Known(n) => Some(n),
            TotalRows::Unknown => None,
        }
    }
}

/// Half-open row range `[start, end)` within one source.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowWindow {
    pub source_key: SourceKey,
    pub start: u64,
    pub end: u64,
}

impl RowWindow {
    /// Build a window, swapping the bounds if they arrive reversed.
    pub fn new(source_key: SourceKey, start: u64, end: u64) -> Self {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        Self {
            source_key,
            start,
            end,
        }
    }

    pub fn from_span(source_key: &SourceKey, span: Range<u64>) -> Self {
        Self::new(source_key.clone(), span.start, span.end)
    }

    pub fn span(&self) -> Range<u64> {
        self.start..self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True when `other` lies entirely inside this window (same source).
    pub fn covers(&self, other: &RowWindow) -> bool {
        self.source_key == other.source_key && self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for RowWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}, {})", self.source_key, self.start, self.end)
    }
}

/// Inclusive visible range reported by the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub first_visible_row: u64,
    pub last_visible_row: u64,
}

impl Viewport {
    pub fn new(first_visible_row: u64, last_visible_row: u64) -> Self {
        Self {
            first_visible_row: first_visible_row.min(last_visible_row),
            last_visible_row: last_visible_row.max(first_visible_row),
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptor, cache and request records
// ---------------------------------------------------------------------------

/// Identity and shape of the dataset currently bound to a grid.
///
/// Replaced wholesale whenever the fingerprint changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub source_key: SourceKey,
    pub fingerprint: Fingerprint,
    pub total_rows: TotalRows,
    pub schema: Vec<String>,
}

impl SourceDescriptor {
    pub fn new(source_key: SourceKey, fingerprint: Fingerprint) -> Self {
        Self {
            source_key,
            fingerprint,
            total_rows: TotalRows::Unknown,
            schema: Vec::new(),
        }
    }

    /// Same identity with a newly learned row count.
    pub fn with_total(&self, total: u64) -> Self {
        Self {
            total_rows: TotalRows::Known(total),
            ..self.clone()
        }
    }

    pub fn with_schema(&self, schema: Vec<String>) -> Self {
        Self {
            schema,
            ..self.clone()
        }
    }
}

/// A cached contiguous run of rows, or a slice of one returned as a hit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub window: RowWindow,
    pub rows: Vec<Row>,
    pub fingerprint: Fingerprint,
}

/// A fetch issued to the backend that has not resolved yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub source_key: SourceKey,
    pub fingerprint: Fingerprint,
    pub window: RowWindow,
    pub issued_at: Instant,
}
