use crate::extract::ExtractionError;
use crate::outline::OutlineError;
use crate::store::StoreError;

/// Failure of a whole clip operation, as surfaced to the caller.
///
/// Per-image failures never reach this type; the image pipeline recovers
/// them locally.
#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("{0}")]
    RemoteApi(String),
    #[error("not configured: {0}")]
    Config(String),
    #[error("an image upload is already in progress")]
    Busy,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ClipError {
    /// Short origin category shown next to the message.
    pub fn category(&self) -> &'static str {
        match self {
            ClipError::Extraction(_) => "extraction",
            ClipError::Auth(_) => "auth",
            ClipError::RemoteApi(_) => "remote",
            ClipError::Config(_) => "config",
            ClipError::Busy => "image",
            ClipError::Store(_) => "store",
        }
    }
}

impl ClipError {
    /// Mapping for the connection test, the one call where a rejected token
    /// is a credentials problem rather than a remote failure.
    pub fn from_auth_check(err: OutlineError) -> Self {
        match err {
            OutlineError::Auth(message) => ClipError::Auth(message),
            other => other.into(),
        }
    }
}

impl From<OutlineError> for ClipError {
    fn from(err: OutlineError) -> Self {
        match err {
            OutlineError::Url(message) => ClipError::Config(message),
            other => ClipError::RemoteApi(other.to_string()),
        }
    }
}
