//! Owner-scoped server-side apply
//!
//! The applier writes every object of a tracked set through server-side
//! apply under this controller's field manager, tagging each with the set's
//! identity. Deletions are computed from the cluster itself: anything still
//! carrying the set's hash label that is absent from the desired set is an
//! orphan and gets removed. A purge is the same operation with an empty
//! desired set.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PropagationPolicy};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

use helmfast_core::ReleaseKey;

use crate::error::Result;
use crate::gvk::{ApiResolver, Gvk, GvkLister};
use crate::objectset::{ObjectKey, ObjectSet};

/// Annotation carrying the full set identity (`namespace/name` of the release)
pub const SET_ID_ANNOTATION: &str = "objectset.helm.cattle.io/id";

/// Label carrying the hashed set identity; label values are length-limited,
/// so selection goes through the hash while the annotation stays readable
pub const SET_HASH_LABEL: &str = "objectset.helm.cattle.io/hash";

/// Annotation naming the synthetic owner type of every applied object
pub const OWNER_GVK_ANNOTATION: &str = "objectset.helm.cattle.io/owner-gvk";

const OWNER_GVK_VALUE: &str = "helm.cattle.io/v1alpha1, Kind=LockedReleaseSet";

/// Applies a desired object set and prunes orphans. Behind a trait so the
/// reconciler can be exercised without a cluster.
#[async_trait]
pub trait ApplySet: Send + Sync {
    /// Converge the cluster on `desired` for the given set identity.
    ///
    /// `known_gvks` widens the orphan search beyond the desired set's own
    /// kinds; when both are empty (purging a set whose shape is unknown)
    /// every server-known GVK is searched.
    async fn apply_set(
        &self,
        key: &ReleaseKey,
        identity: &str,
        desired: Option<&ObjectSet>,
        known_gvks: &[Gvk],
    ) -> Result<()>;
}

/// The real applier, driving the apiserver
pub struct SetApplier {
    resolver: Arc<ApiResolver>,
    lister: GvkLister,
    field_manager: String,
}

impl SetApplier {
    pub fn new(
        resolver: Arc<ApiResolver>,
        lister: GvkLister,
        field_manager: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            lister,
            field_manager: field_manager.into(),
        }
    }
}

#[async_trait]
impl ApplySet for SetApplier {
    async fn apply_set(
        &self,
        key: &ReleaseKey,
        identity: &str,
        desired: Option<&ObjectSet>,
        known_gvks: &[Gvk],
    ) -> Result<()> {
        let hash = set_hash(identity);
        let mut applied: HashMap<Gvk, HashSet<ObjectKey>> = HashMap::new();

        if let Some(set) = desired {
            for (gvk, obj_key, obj) in set.iter() {
                let (ar, namespaced) = self.resolver.resolve(gvk).await?;

                let mut desired_obj = obj.clone();
                tag_object(&mut desired_obj, identity, &hash);

                // rendered objects may omit the namespace; namespaced kinds
                // land in the release namespace
                let namespace = match (&obj_key.namespace, namespaced) {
                    (Some(ns), true) => Some(ns.clone()),
                    (None, true) => Some(key.namespace.clone()),
                    (_, false) => None,
                };
                if namespace.is_some() {
                    desired_obj.metadata.namespace = namespace.clone();
                }

                let api: Api<DynamicObject> = match &namespace {
                    Some(ns) => Api::namespaced_with(self.resolver.client(), ns, &ar),
                    None => Api::all_with(self.resolver.client(), &ar),
                };
                let params = PatchParams::apply(&self.field_manager).force();
                api.patch(&obj_key.name, &params, &Patch::Apply(&desired_obj))
                    .await?;

                applied
                    .entry(gvk.clone())
                    .or_default()
                    .insert(ObjectKey::new(namespace, obj_key.name.clone()));
            }
        }

        let mut universe: Vec<Gvk> = applied.keys().cloned().collect();
        for gvk in known_gvks {
            if !universe.contains(gvk) {
                universe.push(gvk.clone());
            }
        }
        if universe.is_empty() {
            universe = self.lister.list().await?;
        }

        for gvk in &universe {
            let (ar, _) = match self.resolver.resolve(gvk).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    debug!(%gvk, %err, "skipping prune for unresolvable gvk");
                    continue;
                }
            };
            let api: Api<DynamicObject> = Api::all_with(self.resolver.client(), &ar);
            let params = ListParams::default().labels(&format!("{SET_HASH_LABEL}={hash}"));
            let labelled = api.list(&params).await?;

            for item in labelled.items {
                if !is_orphaned(&item, applied.get(gvk), identity) {
                    continue;
                }
                let name = item.metadata.name.clone().unwrap_or_default();
                let delete_api: Api<DynamicObject> = match &item.metadata.namespace {
                    Some(ns) => Api::namespaced_with(self.resolver.client(), ns, &ar),
                    None => Api::all_with(self.resolver.client(), &ar),
                };
                let params = DeleteParams {
                    propagation_policy: Some(PropagationPolicy::Background),
                    ..Default::default()
                };
                match delete_api.delete(&name, &params).await {
                    Ok(_) => info!(%key, %gvk, object = %name, "deleted orphaned object"),
                    Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(())
    }
}

/// An object listed by the set's hash label is orphaned when it is not part
/// of the desired set and its identity annotation matches this set exactly
/// (a hash collision must never delete someone else's object).
fn is_orphaned(
    item: &DynamicObject,
    desired: Option<&HashSet<ObjectKey>>,
    identity: &str,
) -> bool {
    let Some(name) = item.metadata.name.clone() else {
        return false;
    };
    let effective = ObjectKey::new(item.metadata.namespace.clone(), name);
    if desired.is_some_and(|keys| keys.contains(&effective)) {
        return false;
    }
    item.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SET_ID_ANNOTATION))
        .map(String::as_str)
        == Some(identity)
}

fn tag_object(obj: &mut DynamicObject, identity: &str, hash: &str) {
    obj.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(SET_HASH_LABEL.to_string(), hash.to_string());
    let annotations = obj.metadata.annotations.get_or_insert_with(Default::default);
    annotations.insert(SET_ID_ANNOTATION.to_string(), identity.to_string());
    annotations.insert(OWNER_GVK_ANNOTATION.to_string(), OWNER_GVK_VALUE.to_string());
}

/// Stable, label-safe digest of the set identity
fn set_hash(identity: &str) -> String {
    let digest = Sha256::digest(identity.as_bytes());
    let mut hex = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(json: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_set_hash_is_stable_and_label_safe() {
        let a = set_hash("ns1/rel-a");
        let b = set_hash("ns1/rel-a");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(set_hash("ns1/rel-b"), a);
    }

    #[test]
    fn test_tag_object_injects_identity() {
        let mut o = obj(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cm-x", "labels": { "app": "web" } },
        }));
        tag_object(&mut o, "ns1/rel-a", "abc123");

        let labels = o.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(labels.get(SET_HASH_LABEL).map(String::as_str), Some("abc123"));

        let annotations = o.metadata.annotations.as_ref().unwrap();
        assert_eq!(
            annotations.get(SET_ID_ANNOTATION).map(String::as_str),
            Some("ns1/rel-a")
        );
        assert_eq!(
            annotations.get(OWNER_GVK_ANNOTATION).map(String::as_str),
            Some(OWNER_GVK_VALUE)
        );
    }

    #[test]
    fn test_is_orphaned_spares_desired_objects() {
        let item = obj(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm-x",
                "namespace": "ns1",
                "annotations": { "objectset.helm.cattle.io/id": "ns1/rel-a" },
            },
        }));
        let mut desired = HashSet::new();
        desired.insert(ObjectKey::new(Some("ns1".into()), "cm-x"));

        assert!(!is_orphaned(&item, Some(&desired), "ns1/rel-a"));
        // absent from the desired set: orphan
        assert!(is_orphaned(&item, Some(&HashSet::new()), "ns1/rel-a"));
        // purge path: no desired set at all
        assert!(is_orphaned(&item, None, "ns1/rel-a"));
    }

    #[test]
    fn test_is_orphaned_requires_matching_identity() {
        let item = obj(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm-x",
                "namespace": "ns1",
                "annotations": { "objectset.helm.cattle.io/id": "ns1/other-release" },
            },
        }));
        assert!(!is_orphaned(&item, None, "ns1/rel-a"));

        let untagged = obj(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cm-y", "namespace": "ns1" },
        }));
        assert!(!is_orphaned(&untagged, None, "ns1/rel-a"));
    }
}
