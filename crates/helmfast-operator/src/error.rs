//! Error types for the helmfast operator

use thiserror::Error;

/// Result type for operator wiring
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that abort operator start-up. Reconcile-time errors never reach
/// this type; they are retried through the workqueues.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OperatorError {
    /// Kubernetes client error
    #[error("Kubernetes client error: {0}")]
    Client(#[from] kube::Error),

    /// Kubeconfig could not be loaded
    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// Engine-level failure during wiring
    #[error(transparent)]
    Engine(#[from] helmfast_kube::KubeError),

    /// IO error, e.g. installing signal handlers
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
