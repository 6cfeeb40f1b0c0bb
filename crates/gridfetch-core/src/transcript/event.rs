//! Transcript event model and its JSON export format.
//!
//! A transcript is a JSON array of objects, each carrying `event`, `ts`
//! (milliseconds since the recording started) and event-specific fields:
//!
//! ```json
//! [
//!   { "event": "viewport_change", "ts": 0, "first_visible_row": 0, "last_visible_row": 30 },
//!   { "event": "response", "ts": 1000, "request_id": 1, "rows_len": 81, "total_len": 500 }
//! ]
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{GridError, GridResult};
use crate::fingerprint::SourceParams;
use crate::models::{Fingerprint, RequestId, Row, SourceKey, Viewport};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub ts: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TranscriptEvent {
    pub fn new(ts: u64, kind: EventKind) -> Self {
        Self { ts, kind }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// A fetch left for the backend.
    Request {
        request_id: RequestId,
        source_key: SourceKey,
        start: u64,
        end: u64,
        fingerprint: Fingerprint,
    },
    /// A response frame arrived.
    ///
    /// Recorded responses carry the parsed `rows_len`/`total_len` plus the
    /// raw `msg` header and `buffers_len`. Hand-authored ones may instead
    /// give inline `rows`; `request_id` may be left out to answer the oldest
    /// pending request.
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows_len: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_len: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<Vec<Row>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        buffers_len: Option<usize>,
    },
    ViewportChange {
        first_visible_row: u64,
        last_visible_row: u64,
    },
    ParamChange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_key: Option<SourceKey>,
        #[serde(default)]
        params: SourceParams,
    },
    UserAction {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Request { .. } => "request",
            EventKind::Response { .. } => "response",
            EventKind::ViewportChange { .. } => "viewport_change",
            EventKind::ParamChange { .. } => "param_change",
            EventKind::UserAction { .. } => "user_action",
            EventKind::Error { .. } => "error",
        }
    }

    pub fn viewport(viewport: Viewport) -> Self {
        EventKind::ViewportChange {
            first_visible_row: viewport.first_visible_row,
            last_visible_row: viewport.last_visible_row,
        }
    }

    /// Events the pipeline produces itself; replay regenerates them rather
    /// than dispatching them.
    pub fn is_output(&self) -> bool {
        matches!(self, EventKind::Request { .. } | EventKind::Error { .. })
    }
}

/// Ordered event log. Deserializing checks the order like [`Transcript::new`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<TranscriptEvent>", into = "Vec<TranscriptEvent>")]
pub struct Transcript {
    events: Vec<TranscriptEvent>,
}

impl Transcript {
    /// Build a transcript, rejecting timestamps that go backwards.
    pub fn new(events: Vec<TranscriptEvent>) -> GridResult<Self> {
        validate_order(&events)?;
        Ok(Self { events })
    }

    /// Wrap events whose order the caller already guarantees.
    pub(crate) fn from_ordered(events: Vec<TranscriptEvent>) -> Self {
        debug_assert!(validate_order(&events).is_ok());
        Self { events }
    }

    pub fn events(&self) -> &[TranscriptEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Span between the first and last event, in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => last.ts.saturating_sub(first.ts),
            _ => 0,
        }
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.iter().filter(|e| e.name() == name).count()
    }

    pub fn from_json(text: &str) -> GridResult<Self> {
        let events: Vec<TranscriptEvent> = serde_json::from_str(text)?;
        Self::new(events)
    }

    pub fn to_json(&self) -> GridResult<String> {
        Ok(serde_json::to_string_pretty(&self.events)?)
    }

    pub fn load(path: &Path) -> GridResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn save(&self, path: &Path) -> GridResult<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

impl TryFrom<Vec<TranscriptEvent>> for Transcript {
    type Error = GridError;

    fn try_from(events: Vec<TranscriptEvent>) -> GridResult<Self> {
        Self::new(events)
    }
}

impl From<Transcript> for Vec<TranscriptEvent> {
    fn from(transcript: Transcript) -> Self {
        transcript.events
    }
}

impl IntoIterator for Transcript {
    type Item = TranscriptEvent;
    type IntoIter = std::vec::IntoIter<TranscriptEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

fn validate_order(events: &[TranscriptEvent]) -> GridResult<()> {
    for (index, pair) in events.windows(2).enumerate() {
        if pair[1].ts < pair[0].ts {
            return Err(GridError::Transcript(format!(
                "event {} at ts {} precedes previous ts {}",
                index + 1,
                pair[1].ts,
                pair[0].ts
            )));
        }
    }
    Ok(())
}
