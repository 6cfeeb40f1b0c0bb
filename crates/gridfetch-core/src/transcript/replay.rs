//! Transcript replay.
//!
//! A replay drives a fresh pipeline through a recorded or hand-authored
//! transcript: host inputs are re-applied, responses are synthesized from
//! the event fields, and the gaps between event timestamps are slept out on
//! tokio's clock. Requests and errors in the transcript are the pipeline's
//! own output; they are counted, not dispatched.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::config::GridConfig;
use crate::errors::{GridError, GridResult};
use crate::fetch::{ColumnarCodec, FetchRequest, ResponseFrame, Transport};
use crate::fingerprint::SourceParams;
use crate::models::{RequestId, Row, RowWindow, SourceKey, Viewport};
use crate::pipeline::GridPipeline;
use crate::transcript::event::{EventKind, Transcript, TranscriptEvent};
use crate::transcript::recorder::Recorder;

/// Stands in for the live backend: requests are kept for inspection.
#[derive(Clone, Debug, Default)]
pub struct ReplayTransport {
    sent: Arc<Mutex<Vec<FetchRequest>>>,
}

impl ReplayTransport {
    pub fn sent(&self) -> Vec<FetchRequest> {
        self.sent.lock().clone()
    }
}

impl Transport for ReplayTransport {
    fn send(&self, request: &FetchRequest) -> GridResult<()> {
        self.sent.lock().push(request.clone());
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub dispatched: usize,
    pub skipped: usize,
    /// `request` events present in the transcript.
    pub recorded_requests: usize,
    /// Requests the replayed pipeline actually sent.
    pub issued_requests: usize,
    #[serde(serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

pub type ReplayPipeline = GridPipeline<ReplayTransport, ColumnarCodec>;

/// A finished replay: the pipeline in its final state plus the report.
pub struct ReplayRun {
    pub pipeline: ReplayPipeline,
    pub report: ReplayReport,
}

impl ReplayRun {
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.pipeline.coordinator().transport().sent()
    }
}

pub struct Replayer {
    transcript: Transcript,
    config: GridConfig,
    source: Option<(SourceKey, SourceParams)>,
}

impl Replayer {
    pub fn new(transcript: Transcript) -> Self {
        Self {
            transcript,
            config: GridConfig::default(),
            source: None,
        }
    }

    pub fn with_config(mut self, config: GridConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind a source before the first event, for transcripts that start
    /// mid-session.
    pub fn with_source(mut self, key: SourceKey, params: SourceParams) -> Self {
        self.source = Some((key, params));
        self
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Replay the whole transcript from the beginning on a new pipeline.
    ///
    /// Each call starts over; a replay cannot be resumed part way.
    pub async fn run(&self) -> GridResult<ReplayRun> {
        let mut pipeline = GridPipeline::new(
            self.config.clone(),
            ReplayTransport::default(),
            ColumnarCodec,
            Recorder::new(),
        );
        if let Some((key, params)) = &self.source {
            pipeline.bind(key.clone(), params);
        }

        let started = Instant::now();
        let origin = self.transcript.events().first().map_or(0, |e| e.ts);
        let mut report = ReplayReport {
            recorded_requests: self.transcript.count("request"),
            ..ReplayReport::default()
        };
        info!(events = self.transcript.len(), "replay started");

        for event in self.transcript.events() {
            let offset = Duration::from_millis(event.ts.saturating_sub(origin));
            let due = started.checked_add(offset).ok_or_else(|| {
                GridError::Transcript(format!("event at ts {} is too far in the future", event.ts))
            })?;
            settle_until(&mut pipeline, due).await;
            sleep_until(due).await;

            if event.kind.is_output() {
                report.skipped += 1;
                continue;
            }
            if dispatch(&mut pipeline, event)? {
                report.dispatched += 1;
            } else {
                report.skipped += 1;
            }
        }
        if let Some(deadline) = pipeline.debounce_deadline() {
            sleep_until(deadline).await;
            pipeline.poll_debounce(Instant::now());
        }

        report.issued_requests = pipeline.coordinator().transport().sent().len();
        report.elapsed = started.elapsed();
        info!(
            dispatched = report.dispatched,
            skipped = report.skipped,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "replay finished"
        );
        Ok(ReplayRun { pipeline, report })
    }
}

/// Fire every debounce deadline that falls before `due`.
async fn settle_until(pipeline: &mut ReplayPipeline, due: Instant) {
    while let Some(deadline) = pipeline.debounce_deadline() {
        if deadline > due {
            break;
        }
        sleep_until(deadline).await;
        pipeline.poll_debounce(deadline);
    }
}

fn dispatch(pipeline: &mut ReplayPipeline, event: &TranscriptEvent) -> GridResult<bool> {
    match &event.kind {
        EventKind::ViewportChange {
            first_visible_row,
            last_visible_row,
        } => {
            pipeline.notify_viewport(
                Viewport::new(*first_visible_row, *last_visible_row),
                Instant::now(),
            );
        }
        EventKind::ParamChange { source_key, params } => match source_key {
            Some(key) if pipeline.source() != Some(key) => {
                pipeline.bind(key.clone(), params);
            }
            _ => {
                if pipeline.set_params(params).is_err() {
                    debug!(ts = event.ts, "parameter change before any source; skipped");
                    return Ok(false);
                }
            }
        },
        EventKind::UserAction { action, detail } => {
            pipeline.on_user_action(action.clone(), detail.clone());
        }
        EventKind::Response {
            request_id,
            rows_len,
            total_len,
            rows,
            error,
            ..
        } => {
            let Some(id) = (*request_id).or_else(|| pipeline.coordinator().oldest_pending()) else {
                debug!(ts = event.ts, "response with nothing pending; skipped");
                return Ok(false);
            };
            let frame = match error {
                Some(error) => ResponseFrame::error(id, error.clone()),
                None => {
                    let window = pipeline.coordinator().pending(id).map(|p| p.window.clone());
                    synthesize(id, window.as_ref(), rows.clone(), *rows_len, *total_len)?
                }
            };
            pipeline.handle_frame(frame);
        }
        EventKind::Request { .. } | EventKind::Error { .. } => return Ok(false),
    }
    Ok(true)
}

/// Build the frame a backend would have sent for `id`.
///
/// Inline rows win; otherwise `rows_len` rows (or the whole window) are
/// generated with a `row_num` column counting from the window start. A
/// `rows_len` longer than the pending window is cut to it.
fn synthesize(
    id: RequestId,
    window: Option<&RowWindow>,
    rows: Option<Vec<Row>>,
    rows_len: Option<usize>,
    total_len: Option<u64>,
) -> GridResult<ResponseFrame> {
    let start = window.map_or(0, |w| w.start);
    let rows = match rows {
        Some(rows) => rows,
        None => {
            let len = match (rows_len, window) {
                (Some(len), Some(w)) => len.min(w.len() as usize),
                (Some(len), None) => len,
                (None, Some(w)) => w.len() as usize,
                (None, None) => 0,
            };
            (start..start + len as u64)
                .map(|i| {
                    let mut row = Row::new();
                    row.insert("row_num".into(), json!(i));
                    row
                })
                .collect()
        }
    };
    let total = total_len.unwrap_or(start + rows.len() as u64);
    Ok(ResponseFrame::rows(id, ColumnarCodec.encode(&rows)?, total))
}
