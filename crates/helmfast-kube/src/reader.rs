//! Reading Helm release records from cluster secrets
//!
//! Helm stores one secret per release revision in the release's target
//! namespace, labelled with the release name and revision. The reader
//! returns the record with the highest numeric `version` label; secrets
//! with a missing or unparseable version label are skipped, which matches
//! how Helm itself tolerates damaged history.

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;

use helmfast_core::{
    decode_release, Release, ReleaseKey, HELM_SECRET_TYPE, SECRET_DATA_KEY, SECRET_NAME_LABEL,
    SECRET_VERSION_LABEL,
};

use crate::error::{KubeError, Result};

/// True when a secret is a Helm v3 release record
pub fn is_release_secret(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some(HELM_SECRET_TYPE)
}

/// Derive the release key a secret belongs to: its own namespace plus the
/// release name label. None for non-release secrets.
pub fn release_key_from_secret(secret: &Secret) -> Option<ReleaseKey> {
    if !is_release_secret(secret) {
        return None;
    }
    let name = secret.metadata.labels.as_ref()?.get(SECRET_NAME_LABEL)?;
    let namespace = secret.metadata.namespace.as_deref()?;
    Some(ReleaseKey::new(namespace, name.clone()))
}

/// Pick the release secret with the highest numeric version label
fn latest_release_secret(secrets: &[Secret]) -> Option<&Secret> {
    let mut best: Option<(i64, &Secret)> = None;
    for secret in secrets {
        if !is_release_secret(secret) {
            continue;
        }
        let Some(label) = secret
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(SECRET_VERSION_LABEL))
        else {
            debug!(
                secret = secret.metadata.name.as_deref().unwrap_or(""),
                "release secret has no version label; skipping"
            );
            continue;
        };
        let Ok(version) = label.parse::<i64>() else {
            debug!(
                secret = secret.metadata.name.as_deref().unwrap_or(""),
                version = label.as_str(),
                "release secret version label is not numeric; skipping"
            );
            continue;
        };
        if best.map_or(true, |(bv, _)| version > bv) {
            best = Some((version, secret));
        }
    }
    best.map(|(_, secret)| secret)
}

/// Retrieves the latest stored record for a release
pub struct ReleaseReader {
    client: Client,
}

impl ReleaseReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The record with the highest version among secrets labelled with the
    /// release name, or `SecretNotFound`.
    pub async fn last(&self, key: &ReleaseKey) -> Result<Release> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &key.namespace);
        let params =
            ListParams::default().labels(&format!("{SECRET_NAME_LABEL}={}", key.name));
        let secrets = api.list(&params).await?;

        let secret = latest_release_secret(&secrets.items).ok_or_else(|| {
            KubeError::SecretNotFound {
                namespace: key.namespace.clone(),
                name: key.name.clone(),
            }
        })?;

        let payload = secret
            .data
            .as_ref()
            .and_then(|data| data.get(SECRET_DATA_KEY))
            .ok_or_else(|| KubeError::SecretNotFound {
                namespace: key.namespace.clone(),
                name: key.name.clone(),
            })?;

        Ok(decode_release(&payload.0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn secret(name: &str, labels: &[(&str, &str)], type_: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            type_: Some(type_.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_latest_picks_highest_version() {
        let secrets = vec![
            secret("sh.helm.release.v1.rel-a.v1", &[("name", "rel-a"), ("version", "1")], HELM_SECRET_TYPE),
            secret("sh.helm.release.v1.rel-a.v2", &[("name", "rel-a"), ("version", "2")], HELM_SECRET_TYPE),
        ];
        let best = latest_release_secret(&secrets).unwrap();
        assert_eq!(best.metadata.name.as_deref(), Some("sh.helm.release.v1.rel-a.v2"));
    }

    #[test]
    fn test_latest_skips_bad_version_labels() {
        let secrets = vec![
            secret("v-missing", &[("name", "rel-a")], HELM_SECRET_TYPE),
            secret("v-garbage", &[("name", "rel-a"), ("version", "two")], HELM_SECRET_TYPE),
            secret("v-good", &[("name", "rel-a"), ("version", "1")], HELM_SECRET_TYPE),
        ];
        let best = latest_release_secret(&secrets).unwrap();
        assert_eq!(best.metadata.name.as_deref(), Some("v-good"));
    }

    #[test]
    fn test_latest_ignores_foreign_secret_types() {
        let secrets = vec![
            secret("opaque", &[("name", "rel-a"), ("version", "9")], "Opaque"),
        ];
        assert!(latest_release_secret(&secrets).is_none());
    }

    #[test]
    fn test_release_key_from_secret() {
        let s = secret("sh.helm.release.v1.rel-a.v1", &[("name", "rel-a"), ("version", "1")], HELM_SECRET_TYPE);
        assert_eq!(
            release_key_from_secret(&s),
            Some(ReleaseKey::new("ns1", "rel-a"))
        );

        let opaque = secret("other", &[("name", "rel-a")], "Opaque");
        assert_eq!(release_key_from_secret(&opaque), None);

        let unlabelled = secret("bare", &[("version", "1")], HELM_SECRET_TYPE);
        assert_eq!(release_key_from_secret(&unlabelled), None);
    }
}
