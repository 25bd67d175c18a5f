//! Error types for helmfast-kube

use helmfast_core::ReleaseKey;
use thiserror::Error;

/// Result type for helmfast-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur while tracking and reconciling object sets
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// No release secret exists for a release key
    #[error("no release secret found for release '{name}' in namespace '{namespace}'")]
    SecretNotFound { namespace: String, name: String },

    /// A manifest document could not be decoded into a cluster object
    #[error("manifest parse error: {0}")]
    Parse(String),

    /// Release payload decode error
    #[error(transparent)]
    Decode(#[from] helmfast_core::CoreError),

    /// An object in the set is already owned by a different release key
    #[error("cannot lock object set for {key}: object {object} is already associated with key {owner}")]
    OwnershipConflict {
        key: ReleaseKey,
        owner: ReleaseKey,
        object: String,
    },

    /// The requested GVK is not served by the cluster
    #[error("unknown api resource for {0}")]
    UnknownGvk(String),

    /// One or more GVK watches failed to start
    #[error("failed to start gvk watches: {0}")]
    WatchStart(String),

    /// A start-once component was started twice
    #[error("{0} already started")]
    AlreadyStarted(&'static str),
}

impl KubeError {
    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// Check if this is an optimistic-concurrency conflict that should be
    /// retried silently rather than logged
    pub fn is_conflict(&self) -> bool {
        match self {
            KubeError::Api(kube::Error::Api(resp)) => {
                resp.code == 409
                    || resp
                        .message
                        .contains("please apply your changes to the latest version")
            }
            _ => false,
        }
    }
}
