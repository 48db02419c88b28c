use thiserror::Error;

/// Failures surfaced at the orchestration boundary.
///
/// Remote plumbing in [`crate::gemini`] works in `anyhow::Result`; anything that
/// crosses into the studio is folded into one of these variants.
#[derive(Debug, Error)]
pub enum StudioError {
    /// Rejected locally before any network call.
    #[error("{0}")]
    Validation(String),

    #[error("a generation is already in progress")]
    Busy,

    /// Missing or unusable configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),

    #[error("video generation cancelled")]
    Cancelled,

    #[error("video generation timed out after {0}s")]
    TimedOut(u64),
}

impl StudioError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

pub type StudioResult<T> = std::result::Result<T, StudioError>;
