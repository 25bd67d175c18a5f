//! Error types for helmfast-core

use thiserror::Error;

/// Result type for helmfast-core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while decoding release data
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Release payload could not be base64-decoded
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Release payload could not be gunzipped
    #[error("gzip decode error: {0}")]
    Gzip(#[source] std::io::Error),

    /// Release payload is not valid release JSON
    #[error("release JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload was not recognisable in any supported encoding
    #[error("unrecognised release payload: {0}")]
    UnrecognisedPayload(String),

    /// A release key string was not of the form `namespace/name`
    #[error("invalid release key '{0}': expected namespace/name")]
    InvalidKey(String),
}
