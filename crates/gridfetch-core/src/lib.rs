//! gridfetch core library: the windowed row cache and fetch coordination
//! layer behind a virtualized data grid.
//!
//! The grid shows a few dozen rows of a dataset that lives in an
//! out-of-process backend. This crate turns viewport changes into minimal,
//! deduplicated range requests, caches rows per logical source, discards
//! results computed under outdated parameters, and records every step so a
//! session can be replayed with its original pacing.
//!
//! [`pipeline::GridPipeline`] wires the pieces together; each piece is also
//! usable on its own.

pub mod cache;
pub mod config;
pub mod consistency;
pub mod errors;
pub mod fetch;
pub mod fingerprint;
pub mod guards;
pub mod models;
pub mod pipeline;
pub mod transcript;
pub mod viewport;

pub use cache::RowCache;
pub use config::GridConfig;
pub use consistency::ConsistencyGuard;
pub use errors::{GridError, GridResult};
pub use fetch::{FetchCoordinator, ResponseFrame, Transport};
pub use fingerprint::{compute_fingerprint, SourceParams};
pub use models::{Fingerprint, Row, RowWindow, SourceDescriptor, SourceKey, TotalRows, Viewport};
pub use pipeline::{drive, GridPipeline, HostInput, PipelineStats};
pub use transcript::{Recorder, Replayer, Transcript, TranscriptEvent};
pub use viewport::ViewportTranslator;
