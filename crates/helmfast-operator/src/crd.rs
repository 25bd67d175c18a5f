//! The HelmRelease custom resource
//!
//! A HelmRelease *points at* an existing Helm release; it does not own it.
//! The spec names the release, the status mirrors what the controller found
//! in the release's stored record.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use helmfast_core::ReleaseKey;

/// HelmRelease is the schema for the helmreleases API.
///
/// Creating one instructs the controller to lock the named release's
/// rendered manifest against drift while the release is deployed. Deleting
/// one stops the enforcement without touching the release's resources.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "helm.cattle.io",
    version = "v1alpha1",
    kind = "HelmRelease",
    plural = "helmreleases",
    namespaced,
    status = "HelmReleaseStatus",
    printcolumn = r#"{"name":"Release Status", "type":"string", "jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSpec {
    /// The Helm release this resource points at
    #[serde(default)]
    pub release: ReleaseRef,
}

/// Reference to a Helm release by name and target namespace. The namespace
/// is the release's own, which may differ from this resource's namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ReleaseRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseStatus {
    #[serde(default)]
    pub state: ReleaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Observed state of the pointed-at release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum ReleaseState {
    SecretNotFound,
    #[default]
    Unknown,
    Deployed,
    Uninstalled,
    Error,
    Failed,
    Transitioning,
}

impl fmt::Display for ReleaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SecretNotFound => "SecretNotFound",
            Self::Unknown => "Unknown",
            Self::Deployed => "Deployed",
            Self::Uninstalled => "Uninstalled",
            Self::Error => "Error",
            Self::Failed => "Failed",
            Self::Transitioning => "Transitioning",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Condition {
    pub fn now(
        type_: impl Into<String>,
        status: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: status.into(),
            last_update_time: Some(chrono::Utc::now().to_rfc3339()),
            message: Some(message.into()),
            reason: Some(reason.into()),
        }
    }
}

impl HelmRelease {
    /// The release key this resource points at
    pub fn release_key(&self) -> ReleaseKey {
        ReleaseKey::new(
            self.spec.release.namespace.clone(),
            self.spec.release.name.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_key_uses_spec_not_metadata() {
        let cr: HelmRelease = serde_json::from_value(serde_json::json!({
            "apiVersion": "helm.cattle.io/v1alpha1",
            "kind": "HelmRelease",
            "metadata": { "name": "track-rel-a", "namespace": "helmfast-system" },
            "spec": { "release": { "name": "rel-a", "namespace": "ns1" } },
        }))
        .unwrap();
        assert_eq!(cr.release_key(), ReleaseKey::new("ns1", "rel-a"));
    }

    #[test]
    fn test_status_serialises_in_api_shape() {
        let status = HelmReleaseStatus {
            state: ReleaseState::Deployed,
            version: Some(2),
            description: Some("Upgrade complete".into()),
            notes: None,
            conditions: vec![Condition::now("Ready", "True", "Locked", "object set locked")],
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "Deployed");
        assert_eq!(value["version"], 2);
        assert!(value.get("notes").is_none());
        assert_eq!(value["conditions"][0]["type"], "Ready");
        assert!(value["conditions"][0]["lastUpdateTime"].is_string());
    }

    #[test]
    fn test_default_state_is_unknown() {
        assert_eq!(ReleaseState::default(), ReleaseState::Unknown);
        assert_eq!(HelmReleaseStatus::default().state, ReleaseState::Unknown);
    }
}
