use thiserror::Error;

/// Failure taxonomy of the playback engine.
///
/// Only `Configuration` is allowed to end the process (at startup). Every other
/// variant is absorbed by the component that produced it and logged.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Control-channel or fetch failure. Retried on the next schedule.
    #[error("network error: {0}")]
    TransientNetwork(String),

    /// Cache miss with exhausted retries. The item is skipped.
    #[error("content unavailable: {reference} ({reason})")]
    ContentUnavailable { reference: String, reason: String },

    /// Native playback failure. The item is skipped and the next one tried.
    #[error("media backend error: {0}")]
    Backend(String),

    /// Missing or invalid persisted configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Display absent or unwritable. Rendering is disabled.
    #[error("display device {path}: {reason}")]
    DisplayDevice { path: String, reason: String },
}

impl AgentError {
    pub fn content_unavailable(reference: &str, reason: impl ToString) -> Self {
        AgentError::ContentUnavailable {
            reference: reference.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn backend(reason: impl ToString) -> Self {
        AgentError::Backend(reason.to_string())
    }

    pub fn configuration(reason: impl ToString) -> Self {
        AgentError::Configuration(reason.to_string())
    }

    pub fn display_device(path: &str, reason: impl ToString) -> Self {
        AgentError::DisplayDevice {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Configuration(_))
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        AgentError::TransientNetwork(e.to_string())
    }
}
