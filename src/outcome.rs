use std::path::PathBuf;

use crate::intake::ReferenceImage;

pub const CENSORED_MESSAGE: &str =
    "The dark ritual yielded no image. The vision was censored by the ether.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Image(ReferenceImage),
    /// Path of the materialized video, playable locally.
    Video(PathBuf),
}

/// Result of one generation attempt.
///
/// `Censored` means the service answered without error but produced nothing
/// usable. `Failed` means the call itself broke. Callers show them differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Success {
        text: Option<String>,
        artifact: Artifact,
    },
    Censored {
        preview: ReferenceImage,
        label: String,
        message: String,
    },
    Failed {
        message: String,
    },
}

impl GenerationOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Message to show the user, if any.
    pub fn user_message(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Censored { message, .. } => Some(message),
            Self::Failed { message } => Some(message),
        }
    }
}
