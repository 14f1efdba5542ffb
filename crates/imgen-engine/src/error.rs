use thiserror::Error;

#[derive(Debug, Error)]
pub enum MidjourneyError {
    #[error("missing Midjourney configuration: {}", .0.join(", "))]
    Configuration(Vec<&'static str>),
    #[error("Midjourney transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("Midjourney job submission rejected: {0}")]
    Submission(String),
    #[error("Midjourney generation failed: {0}")]
    Protocol(String),
    #[error("no image URLs received from Midjourney")]
    EmptyResult,
}

impl MidjourneyError {
    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Keeps `source` reachable through [`std::error::Error::source`].
    pub(crate) fn transport_from(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(source),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("image download failed ({url}): {message}")]
    Transport { url: String, message: String },
    #[error("image payload from {origin} is empty")]
    EmptyPayload { origin: String },
    #[error("inline image payload is not valid base64")]
    InvalidInline(#[from] base64::DecodeError),
}
