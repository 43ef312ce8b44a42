//! Error type shared by the asset cache and the download-session broker.

use thiserror::Error;

/// Failures surfaced by the cache components.
///
/// Storage plumbing works in `anyhow::Result` and is lifted into
/// [`Error::Upstream`] at the component boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing request fields. Nothing was attempted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The referenced campaign or session does not exist (or has expired).
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Durable store, object storage or HTTP failure.
    #[error("upstream failure: {0:#}")]
    Upstream(#[from] anyhow::Error),

    /// An upstream call exceeded its bounded timeout.
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: &'static str, millis: u64 },
}

impl Error {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// True for failures caused by a collaborator rather than the caller.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
