//! Error types for the gridfetch core library.

/// Top-level error enum for the gridfetch core library.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Decode failure: {0}")]
    Decode(String),

    #[error("Stale response for request {request_id} (fingerprint {fingerprint})")]
    StaleResponse { request_id: u64, fingerprint: String },

    #[error("Requested rows [{start}, {end}) lie beyond the known row count {total}")]
    OutOfRange { start: u64, end: u64, total: u64 },

    #[error("Transcript error: {0}")]
    Transcript(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GridError {
    /// Whether the failure is shown to the rendering layer as `error_info`.
    ///
    /// Stale responses are the normal outcome of rapid parameter toggling and
    /// out-of-range windows are clamped and retried, so neither is surfaced.
    pub fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            GridError::StaleResponse { .. } | GridError::OutOfRange { .. }
        )
    }
}

pub type GridResult<T> = Result<T, GridError>;
