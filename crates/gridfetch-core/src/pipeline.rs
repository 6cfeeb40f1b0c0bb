//! One grid's fetch pipeline: cache, coordinator, guard, translator and
//! recorder wired together.
//!
//! A pipeline owns its cache outright. Two grids, or one grid rebound to a
//! new dataset, never share rows.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, RowCache};
use crate::config::GridConfig;
use crate::consistency::{Admission, ConsistencyGuard, GuardStats, Rebind};
use crate::errors::{GridError, GridResult};
use crate::fetch::{
    CoordinatorStats, FetchCoordinator, FetchResponse, ResponseFrame, RowDecoder, Transport,
};
use crate::fingerprint::SourceParams;
use crate::models::{Row, SourceKey, TotalRows, Viewport};
use crate::transcript::{EventKind, Recorder};
use crate::viewport::{RetryBudget, Target, Translation, ViewportTranslator};

/// What became of one response frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Admitted(Admission),
    /// No pending or retired request matches the frame.
    Orphaned,
    /// The frame carried no usable request id.
    Unreadable,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub cache: CacheStats,
    pub fetch: CoordinatorStats,
    pub guard: GuardStats,
    pub recorded_events: usize,
    pub error_info: Option<String>,
}

pub struct GridPipeline<T, D> {
    config: GridConfig,
    cache: RowCache,
    coordinator: FetchCoordinator<T, D>,
    guard: ConsistencyGuard,
    translator: ViewportTranslator,
    budget: RetryBudget,
    recorder: Recorder,
    source: Option<SourceKey>,
    error_info: Option<String>,
}

impl<T: Transport, D: RowDecoder> GridPipeline<T, D> {
    pub fn new(config: GridConfig, transport: T, decoder: D, recorder: Recorder) -> Self {
        let config = config.clamped();
        Self {
            cache: RowCache::new(config.max_cached_rows),
            coordinator: FetchCoordinator::new(transport, decoder, config.max_window_rows),
            guard: ConsistencyGuard::new(),
            translator: ViewportTranslator::new(config.prefetch_margin, config.debounce),
            budget: RetryBudget::new(config.max_fetch_attempts),
            recorder,
            source: None,
            error_info: None,
            config,
        }
    }

    // -----------------------------------------------------------------------
    // Source binding
    // -----------------------------------------------------------------------

    /// Bind the grid to `key` under `params`, dropping any other source.
    pub fn bind(&mut self, key: SourceKey, params: &SourceParams) -> Rebind {
        self.recorder.record(EventKind::ParamChange {
            source_key: Some(key.clone()),
            params: params.clone(),
        });
        if let Some(old) = self.source.take() {
            if old != key {
                info!(from = %old, to = %key, "grid source replaced");
                self.guard.unbind(&old, &mut self.cache, &mut self.coordinator);
                self.budget.clear_source(&old);
            }
        }
        self.source = Some(key.clone());
        self.rebind(&key, params)
    }

    /// Apply new parameters to the bound source.
    pub fn set_params(&mut self, params: &SourceParams) -> GridResult<Rebind> {
        let key = self
            .source
            .clone()
            .ok_or_else(|| GridError::Config("no source bound".into()))?;
        self.recorder.record(EventKind::ParamChange {
            source_key: None,
            params: params.clone(),
        });
        Ok(self.rebind(&key, params))
    }

    fn rebind(&mut self, key: &SourceKey, params: &SourceParams) -> Rebind {
        let rebind = self
            .guard
            .rebind(key, params, &mut self.cache, &mut self.coordinator);
        if rebind.changed() {
            self.budget.clear_source(key);
            self.refresh();
        }
        rebind
    }

    /// Tell the pipeline the source's row count ahead of any response.
    pub fn set_total_rows(&mut self, total: u64) -> Option<Translation> {
        let key = self.source.clone()?;
        if self.guard.learn_total(&key, total, &mut self.cache) {
            return self.refresh();
        }
        None
    }

    pub fn source(&self) -> Option<&SourceKey> {
        self.source.as_ref()
    }

    pub fn total_rows(&self) -> TotalRows {
        self.source
            .as_ref()
            .and_then(|k| self.guard.descriptor(k))
            .map(|d| d.total_rows)
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Viewport
    // -----------------------------------------------------------------------

    /// Report a viewport; it is translated once the debounce period passes
    /// without another report.
    pub fn notify_viewport(&mut self, viewport: Viewport, now: Instant) {
        self.recorder.record(EventKind::viewport(viewport));
        self.translator.notify(viewport, now);
    }

    pub fn debounce_deadline(&self) -> Option<Instant> {
        self.translator.deadline()
    }

    /// Translate the pending viewport if it has settled by `now`.
    pub fn poll_debounce(&mut self, now: Instant) -> Option<Translation> {
        self.translator.take_settled(now)?;
        self.refresh()
    }

    /// Translate a viewport immediately, skipping the debounce.
    pub fn apply_viewport(&mut self, viewport: Viewport) -> Option<Translation> {
        self.recorder.record(EventKind::viewport(viewport));
        self.translator.settle(viewport);
        self.refresh()
    }

    /// Re-translate the last settled viewport against the current source.
    pub fn refresh(&mut self) -> Option<Translation> {
        let key = self.source.clone()?;
        let viewport = self.translator.current()?;
        let descriptor = self.guard.descriptor(&key)?;
        let fingerprint = descriptor.fingerprint.clone();
        let total = descriptor.total_rows;

        let translation = self.translator.translate(
            &key,
            &fingerprint,
            viewport,
            total,
            &mut self.cache,
            &mut self.coordinator,
            &self.budget,
        );

        for request in translation.handles.iter().flat_map(|h| h.issued.iter()) {
            self.recorder.record(EventKind::Request {
                request_id: request.request_id,
                source_key: request.source_key.clone(),
                start: request.range[0],
                end: request.range[1],
                fingerprint: request.fingerprint.clone(),
            });
        }
        if let Target::OutOfRange { start, end, total } = translation.target {
            let err = GridError::OutOfRange { start, end, total };
            debug!(source = %key, error = %err, "nothing to fetch");
        }
        if !translation.blocked.is_empty() {
            debug!(source = %key, blocked = translation.blocked.len(), "windows over retry budget");
        }
        if let Some(err) = &translation.error {
            self.report_error(err, None);
        }
        Some(translation)
    }

    // -----------------------------------------------------------------------
    // Responses
    // -----------------------------------------------------------------------

    /// Feed one frame from the backend through the pipeline.
    pub fn handle_frame(&mut self, frame: ResponseFrame) -> FrameOutcome {
        let msg = frame.msg.clone();
        let buffers_len = frame.buffers_len();
        let response = match FetchResponse::from_frame(frame) {
            Ok(response) => response,
            Err(err) => {
                self.recorder.record(EventKind::Response {
                    request_id: None,
                    rows_len: None,
                    total_len: None,
                    rows: None,
                    error: None,
                    msg: Some(msg),
                    buffers_len: Some(buffers_len),
                });
                self.report_error(&err, None);
                return FrameOutcome::Unreadable;
            }
        };
        let request_id = response.request_id;

        let Some(completion) = self.coordinator.resolve(response) else {
            self.recorder.record(EventKind::Response {
                request_id: Some(request_id),
                rows_len: None,
                total_len: None,
                rows: None,
                error: None,
                msg: Some(msg),
                buffers_len: Some(buffers_len),
            });
            return FrameOutcome::Orphaned;
        };

        let (rows_len, total_len, error) = match &completion.outcome {
            Ok(fetched) => (Some(fetched.rows.len()), Some(fetched.total_row_count), None),
            Err(GridError::StaleResponse { .. }) => (None, None, None),
            Err(err) => (None, None, Some(err.to_string())),
        };
        self.recorder.record(EventKind::Response {
            request_id: Some(request_id),
            rows_len,
            total_len,
            rows: None,
            error,
            msg: Some(msg),
            buffers_len: Some(buffers_len),
        });

        let window = completion.request.window.clone();
        let admission = self.guard.admit(completion, &mut self.cache);
        match &admission {
            Admission::Stored { total_changed, .. } => {
                self.budget.record_success(&window.source_key);
                if *total_changed {
                    self.refresh();
                }
            }
            Admission::Stale => {}
            Admission::Failed(message) => {
                let attempts = self.budget.record_failure(&window);
                warn!(request_id, window = %window, attempts, "fetch failed");
                self.set_error(message.clone(), Some(request_id));
                self.refresh();
            }
        }
        FrameOutcome::Admitted(admission)
    }

    fn report_error(&mut self, err: &GridError, request_id: Option<u64>) {
        if err.is_user_visible() {
            self.set_error(err.to_string(), request_id);
        }
    }

    fn set_error(&mut self, message: String, request_id: Option<u64>) {
        self.recorder.record(EventKind::Error {
            message: message.clone(),
            request_id,
        });
        self.error_info = Some(message);
    }

    // -----------------------------------------------------------------------
    // Rendering surface
    // -----------------------------------------------------------------------

    /// Cached row at `index` of the bound source; `None` renders as a
    /// placeholder.
    pub fn row(&self, index: u64) -> Option<&Row> {
        self.cache.row(self.source.as_ref()?, index)
    }

    /// Rows `[start, end)` of the bound source, `None` where not cached.
    pub fn rows(&self, start: u64, end: u64) -> Vec<Option<&Row>> {
        (start..end).map(|i| self.row(i)).collect()
    }

    /// Most recent unrecovered failure.
    pub fn error_info(&self) -> Option<&str> {
        self.error_info.as_deref()
    }

    /// Clear `error_info`; failed windows become eligible for fetching again.
    pub fn clear_error_info(&mut self) {
        self.error_info = None;
        self.budget.clear();
    }

    pub fn on_user_action(&mut self, action: impl Into<String>, detail: Option<Value>) {
        self.recorder.record(EventKind::UserAction {
            action: action.into(),
            detail,
        });
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn cache(&self) -> &RowCache {
        &self.cache
    }

    pub fn coordinator(&self) -> &FetchCoordinator<T, D> {
        &self.coordinator
    }

    pub fn guard(&self) -> &ConsistencyGuard {
        &self.guard
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            cache: self.cache.stats(),
            fetch: self.coordinator.stats(),
            guard: self.guard.stats(),
            recorded_events: self.recorder.len(),
            error_info: self.error_info.clone(),
        }
    }

    /// Apply one host message.
    pub fn handle_input(&mut self, input: HostInput) {
        match input {
            HostInput::Viewport(viewport) => self.notify_viewport(viewport, Instant::now()),
            HostInput::Bind { source_key, params } => {
                self.bind(source_key, &params);
            }
            HostInput::Params(params) => {
                if let Err(err) = self.set_params(&params) {
                    warn!(error = %err, "parameter change ignored");
                }
            }
            HostInput::TotalRows(total) => {
                self.set_total_rows(total);
            }
            HostInput::UserAction { action, detail } => self.on_user_action(action, detail),
            HostInput::ClearError => {
                self.clear_error_info();
                self.refresh();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Async driver
// ---------------------------------------------------------------------------

/// Messages from the grid host.
#[derive(Clone, Debug, PartialEq)]
pub enum HostInput {
    Viewport(Viewport),
    Bind {
        source_key: SourceKey,
        params: SourceParams,
    },
    Params(SourceParams),
    TotalRows(u64),
    UserAction {
        action: String,
        detail: Option<Value>,
    },
    ClearError,
}

/// Run `pipeline` until the host input channel closes.
///
/// Response frames and the debounce timer are serviced in between host
/// messages; nothing here blocks on an outstanding fetch.
pub async fn drive<T: Transport, D: RowDecoder>(
    mut pipeline: GridPipeline<T, D>,
    mut input: mpsc::UnboundedReceiver<HostInput>,
    mut responses: mpsc::UnboundedReceiver<ResponseFrame>,
) -> GridPipeline<T, D> {
    loop {
        let deadline = pipeline.debounce_deadline();
        tokio::select! {
            message = input.recv() => match message {
                Some(message) => pipeline.handle_input(message),
                None => break,
            },
            Some(frame) = responses.recv() => {
                pipeline.handle_frame(frame);
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                pipeline.poll_debounce(Instant::now());
            }
        }
    }
    debug!(stats = ?pipeline.stats(), "pipeline driver stopped");
    pipeline
}
