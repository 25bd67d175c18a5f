//! Helmfast Core - Kubernetes-free data model for helmfast
//!
//! This crate provides:
//! - **Release Keys**: The (namespace, name) pair identifying a Helm release
//! - **Release Records**: Helm's serialised view of an install, as stored in
//!   `helm.sh/release.v1` secrets
//! - **Payload Decoding**: Robust decoding of the release payload, including
//!   the historical double-base64 form produced by some Helm v3 tooling

pub mod error;
pub mod key;
pub mod release;

pub use error::{CoreError, Result};
pub use key::ReleaseKey;
pub use release::{
    decode_release, Release, ReleaseStatus, HELM_SECRET_TYPE, SECRET_DATA_KEY, SECRET_NAME_LABEL,
    SECRET_VERSION_LABEL,
};
