//! Session transcripts: recording pipeline events and replaying them.

pub mod event;
pub mod recorder;
pub mod replay;

pub use event::{EventKind, Transcript, TranscriptEvent};
pub use recorder::Recorder;
pub use replay::{ReplayPipeline, ReplayReport, ReplayRun, ReplayTransport, Replayer};
