//! Fetch coordinator: deduplicated range requests and response matching.
//!
//! Re-render triggers (scroll, resize) fire far more often than data
//! changes, so the coordinator never sends a wire request for rows already
//! covered by a pending request of the same `(source, fingerprint)`. A window
//! that is only partly covered issues requests for its uncovered gaps alone,
//! which keeps pending windows of one fingerprint pairwise disjoint.

use std::collections::BTreeMap;
use std::ops::Range;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::windows::{gaps, split_span};
use crate::errors::{GridError, GridResult};
use crate::fetch::codec::RowDecoder;
use crate::fetch::protocol::{FetchRequest, FetchResponse, ResponseBody};
use crate::fetch::transport::Transport;
use crate::models::{Fingerprint, PendingRequest, RequestId, Row, RowWindow, SourceKey};

/// Retired requests remembered so late responses can be classified as stale.
const MAX_RETIRED: usize = 1024;

/// What one call to [`FetchCoordinator::request`] did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchHandle {
    /// Wire requests sent by this call.
    pub issued: Vec<FetchRequest>,
    /// Already-pending requests that cover part or all of the window.
    pub joined: Vec<RequestId>,
}

impl FetchHandle {
    pub fn request_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.joined.clone();
        ids.extend(self.issued.iter().map(|r| r.request_id));
        ids.sort_unstable();
        ids
    }

    /// True when the window was entirely served by in-flight requests.
    pub fn is_deduplicated(&self) -> bool {
        self.issued.is_empty() && !self.joined.is_empty()
    }
}

/// Decoded rows from a successful response.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedRows {
    pub rows: Vec<Row>,
    pub total_row_count: u64,
}

/// A response matched to the request that asked for it.
#[derive(Debug)]
pub struct Completion {
    pub request: PendingRequest,
    /// The request was discarded by a source rebind before it answered.
    pub retired: bool,
    pub outcome: GridResult<FetchedRows>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub pending: usize,
    pub issued: u64,
    pub deduplicated: u64,
    pub completed: u64,
    pub failed: u64,
    pub orphaned: u64,
}

pub struct FetchCoordinator<T, D> {
    transport: T,
    decoder: D,
    max_window_rows: Option<u64>,
    next_id: RequestId,
    pending: BTreeMap<RequestId, PendingRequest>,
    retired: IndexMap<RequestId, PendingRequest>,
    issued: u64,
    deduplicated: u64,
    completed: u64,
    failed: u64,
    orphaned: u64,
}

impl<T: Transport, D: RowDecoder> FetchCoordinator<T, D> {
    /// `max_window_rows` caps the size of one wire request; `None` sends each
    /// uncovered gap whole.
    pub fn new(transport: T, decoder: D, max_window_rows: Option<u64>) -> Self {
        Self {
            transport,
            decoder,
            max_window_rows: max_window_rows.map(|cap| cap.max(1)),
            next_id: 1,
            pending: BTreeMap::new(),
            retired: IndexMap::new(),
            issued: 0,
            deduplicated: 0,
            completed: 0,
            failed: 0,
            orphaned: 0,
        }
    }

    /// Ask the backend for `window` under `fingerprint`, reusing any pending
    /// request that already covers part of it.
    ///
    /// On a transport failure the failing request is not left pending;
    /// requests issued earlier in the same call stay in flight.
    pub fn request(
        &mut self,
        window: &RowWindow,
        fingerprint: &Fingerprint,
    ) -> GridResult<FetchHandle> {
        let mut handle = FetchHandle::default();
        if window.is_empty() {
            return Ok(handle);
        }

        let span = window.span();
        let mut covering: Vec<(Range<u64>, RequestId)> = self
            .pending
            .values()
            .filter(|p| p.source_key == window.source_key && p.fingerprint == *fingerprint)
            .filter(|p| p.window.start < span.end && span.start < p.window.end)
            .map(|p| (p.window.span(), p.request_id))
            .collect();
        covering.sort_by_key(|(s, _)| s.start);
        handle.joined = covering.iter().map(|(_, id)| *id).collect();

        let covered: Vec<Range<u64>> = covering.into_iter().map(|(s, _)| s).collect();
        let missing = gaps(&covered, &span);
        if missing.is_empty() {
            self.deduplicated += 1;
            debug!(window = %window, joined = ?handle.joined, "fetch deduplicated");
            return Ok(handle);
        }

        for gap in missing {
            let pieces = match self.max_window_rows {
                Some(cap) => split_span(gap, cap),
                None => vec![gap],
            };
            for piece in pieces {
                let request_id = self.next_id;
                self.next_id += 1;
                let piece_window = RowWindow::from_span(&window.source_key, piece);
                let request = FetchRequest::new(request_id, &piece_window, fingerprint);
                if let Err(err) = self.transport.send(&request) {
                    warn!(window = %piece_window, error = %err, "fetch request could not be sent");
                    self.failed += 1;
                    return Err(err);
                }
                self.pending.insert(
                    request_id,
                    PendingRequest {
                        request_id,
                        source_key: window.source_key.clone(),
                        fingerprint: fingerprint.clone(),
                        window: piece_window.clone(),
                        issued_at: Instant::now(),
                    },
                );
                self.issued += 1;
                debug!(request_id, window = %piece_window, fingerprint = %fingerprint, "fetch issued");
                handle.issued.push(request);
            }
        }
        Ok(handle)
    }

    /// Match a response to its request and decode its rows.
    ///
    /// Returns `None` for responses nobody is waiting for.
    pub fn resolve(&mut self, response: FetchResponse) -> Option<Completion> {
        let (request, retired) = match self.pending.remove(&response.request_id) {
            Some(p) => (p, false),
            None => match self.retired.shift_remove(&response.request_id) {
                Some(p) => (p, true),
                None => {
                    self.orphaned += 1;
                    warn!(request_id = response.request_id, "response for unknown request dropped");
                    return None;
                }
            },
        };

        let outcome = if retired {
            // Rows for a discarded fingerprint are never decoded.
            Err(GridError::StaleResponse {
                request_id: request.request_id,
                fingerprint: request.fingerprint.to_string(),
            })
        } else {
            match response.body {
                ResponseBody::Rows {
                    buffer,
                    total_row_count,
                } => self
                    .decoder
                    .decode(&buffer)
                    .map(|rows| FetchedRows {
                        rows,
                        total_row_count,
                    }),
                ResponseBody::Error { error } => Err(GridError::Transport(error)),
                ResponseBody::Malformed { reason } => Err(GridError::Decode(reason)),
            }
        };

        match &outcome {
            Ok(fetched) => {
                self.completed += 1;
                debug!(
                    request_id = request.request_id,
                    rows = fetched.rows.len(),
                    total = fetched.total_row_count,
                    "fetch completed"
                );
            }
            Err(GridError::StaleResponse { .. }) => {}
            Err(err) => {
                self.failed += 1;
                warn!(request_id = request.request_id, error = %err, "fetch failed");
            }
        }

        Some(Completion {
            request,
            retired,
            outcome,
        })
    }

    /// Retire every pending request for `key`; their responses will be
    /// reported as stale and never decoded.
    pub fn discard_source(&mut self, key: &SourceKey) -> Vec<RequestId> {
        let ids: Vec<RequestId> = self
            .pending
            .values()
            .filter(|p| p.source_key == *key)
            .map(|p| p.request_id)
            .collect();
        for id in &ids {
            if let Some(p) = self.pending.remove(id) {
                self.retired.insert(*id, p);
            }
        }
        while self.retired.len() > MAX_RETIRED {
            self.retired.shift_remove_index(0);
        }
        if !ids.is_empty() {
            debug!(source = %key, discarded = ids.len(), "pending fetches retired");
        }
        ids
    }

    pub fn pending(&self, id: RequestId) -> Option<&PendingRequest> {
        self.pending.get(&id)
    }

    /// Pending request ids in issue order.
    pub fn pending_ids(&self) -> Vec<RequestId> {
        self.pending.keys().copied().collect()
    }

    pub fn oldest_pending(&self) -> Option<RequestId> {
        self.pending.keys().next().copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            pending: self.pending.len(),
            issued: self.issued,
            deduplicated: self.deduplicated,
            completed: self.completed,
            failed: self.failed,
            orphaned: self.orphaned,
        }
    }
}
