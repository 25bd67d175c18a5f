//! Helmfast Operator - the HelmRelease controller
//!
//! This crate provides:
//! - **HelmRelease CRD**: the `helm.cattle.io/v1alpha1` custom resource
//!   pointing at a Helm release
//! - **Release Controller**: watches HelmReleases and release secrets,
//!   mediating between stored release records and the object-set register
//! - **Operator wiring**: client construction, component assembly and
//!   graceful shutdown

pub mod controller;
pub mod crd;
pub mod error;
pub mod info;
pub mod operator;

pub use controller::ReleaseController;
pub use crd::{Condition, HelmRelease, HelmReleaseSpec, HelmReleaseStatus, ReleaseRef, ReleaseState};
pub use error::{OperatorError, Result};
pub use info::ReleaseView;
pub use operator::{run, OperatorOptions};
