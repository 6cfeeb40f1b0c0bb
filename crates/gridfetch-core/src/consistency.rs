//! Consistency guard: keeps the cache in step with the current source
//! descriptor.
//!
//! The race this resolves is a response computed under an old fingerprint
//! arriving after the host has moved on. Toggling a parameter A→B→A quickly
//! must converge on A's rows, never flash B's.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{PutOutcome, RowCache};
use crate::fetch::{Completion, FetchCoordinator, RowDecoder, Transport};
use crate::fingerprint::{compute_fingerprint, SourceParams};
use crate::models::{Fingerprint, RequestId, SourceDescriptor, SourceKey, TotalRows};

/// Result of binding a key to a fingerprint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rebind {
    pub descriptor: SourceDescriptor,
    pub previous: Option<Fingerprint>,
    /// Pending requests retired because their fingerprint is gone.
    pub retired: Vec<RequestId>,
    /// Cached rows dropped for the old fingerprint.
    pub dropped_rows: usize,
}

impl Rebind {
    pub fn changed(&self) -> bool {
        self.previous.as_ref() != Some(&self.descriptor.fingerprint)
    }
}

/// What happened to an arriving response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Rows were written to the cache.
    Stored {
        rows: usize,
        evicted: usize,
        /// The response reported a row count different from the last known.
        total_changed: bool,
    },
    /// Fingerprint no longer current; rows discarded.
    Stale,
    /// The request failed; the message is suitable for `error_info`.
    Failed(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GuardStats {
    pub sources: usize,
    pub rebinds: u64,
    pub stale_responses: u64,
}

#[derive(Default)]
pub struct ConsistencyGuard {
    descriptors: HashMap<SourceKey, SourceDescriptor>,
    rebinds: u64,
    stale_responses: u64,
}

impl ConsistencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor(&self, key: &SourceKey) -> Option<&SourceDescriptor> {
        self.descriptors.get(key)
    }

    pub fn fingerprint(&self, key: &SourceKey) -> Option<&Fingerprint> {
        self.descriptors.get(key).map(|d| &d.fingerprint)
    }

    /// Recompute the fingerprint for `params` and bind it to `key`.
    ///
    /// When it differs from the current one, the old descriptor is replaced
    /// and everything cached or pending under it is discarded before this
    /// returns, so the next request already carries the new fingerprint.
    pub fn rebind<T: Transport, D: RowDecoder>(
        &mut self,
        key: &SourceKey,
        params: &SourceParams,
        cache: &mut RowCache,
        coordinator: &mut FetchCoordinator<T, D>,
    ) -> Rebind {
        self.rebind_fingerprint(key, compute_fingerprint(params), cache, coordinator)
    }

    pub fn rebind_fingerprint<T: Transport, D: RowDecoder>(
        &mut self,
        key: &SourceKey,
        fingerprint: Fingerprint,
        cache: &mut RowCache,
        coordinator: &mut FetchCoordinator<T, D>,
    ) -> Rebind {
        let previous = self.descriptors.get(key).map(|d| d.fingerprint.clone());
        if previous.as_ref() == Some(&fingerprint) {
            let descriptor = self.descriptors[key].clone();
            return Rebind {
                descriptor,
                previous,
                retired: Vec::new(),
                dropped_rows: 0,
            };
        }

        let before = cache.cached_rows();
        cache.activate(key, &fingerprint);
        let dropped_rows = before - cache.cached_rows();
        let retired = coordinator.discard_source(key);

        // A new fingerprint may describe a differently sized result; the row
        // count is relearned from the first response.
        let descriptor = SourceDescriptor::new(key.clone(), fingerprint);
        self.descriptors.insert(key.clone(), descriptor.clone());
        self.rebinds += 1;
        info!(
            source = %key,
            fingerprint = %descriptor.fingerprint,
            previous = ?previous.as_ref().map(|f| f.as_str()),
            retired = retired.len(),
            dropped_rows,
            "source rebound"
        );
        Rebind {
            descriptor,
            previous,
            retired,
            dropped_rows,
        }
    }

    /// Forget a source entirely.
    pub fn unbind<T: Transport, D: RowDecoder>(
        &mut self,
        key: &SourceKey,
        cache: &mut RowCache,
        coordinator: &mut FetchCoordinator<T, D>,
    ) {
        self.descriptors.remove(key);
        cache.remove_source(key);
        coordinator.discard_source(key);
    }

    /// Route a completed fetch: current rows go to the cache, stale rows are
    /// dropped and counted, failures are reported.
    pub fn admit(&mut self, completion: Completion, cache: &mut RowCache) -> Admission {
        let request = &completion.request;
        let current = self.descriptors.get(&request.source_key);
        let is_current = !completion.retired
            && current.is_some_and(|d| d.fingerprint == request.fingerprint);
        if !is_current {
            self.stale_responses += 1;
            debug!(
                request_id = request.request_id,
                fingerprint = %request.fingerprint,
                "stale response discarded"
            );
            return Admission::Stale;
        }

        let fetched = match completion.outcome {
            Ok(fetched) => fetched,
            Err(err) => return Admission::Failed(err.to_string()),
        };

        let key = request.source_key.clone();
        let total = fetched.total_row_count;
        let total_changed = self.learn_total(&key, total, cache);
        if let Some(first) = fetched.rows.first() {
            let learned: Vec<String> = first.keys().cloned().collect();
            if let Some(d) = self.descriptors.get_mut(&key) {
                if d.schema != learned {
                    *d = d.with_schema(learned);
                }
            }
        }

        match cache.put(&key, &request.window, fetched.rows, &request.fingerprint) {
            PutOutcome::Stored { rows, evicted } => Admission::Stored {
                rows,
                evicted,
                total_changed,
            },
            PutOutcome::Empty => Admission::Stored {
                rows: 0,
                evicted: 0,
                total_changed,
            },
            PutOutcome::StaleWrite => {
                self.stale_responses += 1;
                Admission::Stale
            }
        }
    }

    /// Record a row count reported by the backend. Returns `true` when it
    /// differs from the last known count; a shrink truncates the cache.
    pub fn learn_total(&mut self, key: &SourceKey, total: u64, cache: &mut RowCache) -> bool {
        let Some(descriptor) = self.descriptors.get_mut(key) else {
            return false;
        };
        let previous = descriptor.total_rows;
        if previous == TotalRows::Known(total) {
            return false;
        }
        *descriptor = descriptor.with_total(total);
        if let TotalRows::Known(old) = previous {
            if total < old {
                let dropped = cache.truncate(key, total);
                debug!(source = %key, old, total, dropped, "source shrank");
            }
        }
        true
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            sources: self.descriptors.len(),
            rebinds: self.rebinds,
            stale_responses: self.stale_responses,
        }
    }
}
