//! Manifest parsing into object sets
//!
//! A rendered manifest is a stream of YAML documents separated by `---`,
//! possibly with trailing JSON (YAML is a superset, so the same decoder
//! handles both). Empty and comment-only documents are skipped. No schema
//! validation happens here; scope resolution is the apply engine's job.

use kube::api::DynamicObject;
use serde::Deserialize;

use super::{ObjectKey, ObjectSet};
use crate::error::{KubeError, Result};
use crate::gvk::Gvk;

/// Parse a multi-document manifest into an [`ObjectSet`].
///
/// Fails only when a non-empty document cannot be decoded as an object
/// carrying `apiVersion` and `kind`. Everything else is accepted as given,
/// including documents without a name.
pub fn parse(manifest: &str) -> Result<ObjectSet> {
    let mut set = ObjectSet::new();

    for (index, doc) in serde_yaml::Deserializer::from_str(manifest).enumerate() {
        let value = serde_yaml::Value::deserialize(doc)
            .map_err(|e| KubeError::Parse(format!("document {index}: {e}")))?;
        if value.is_null() {
            continue;
        }

        let obj: DynamicObject = serde_yaml::from_value(value)
            .map_err(|e| KubeError::Parse(format!("document {index}: {e}")))?;

        let types = obj.types.as_ref().ok_or_else(|| {
            KubeError::Parse(format!("document {index}: missing apiVersion or kind"))
        })?;
        if types.api_version.is_empty() || types.kind.is_empty() {
            return Err(KubeError::Parse(format!(
                "document {index}: missing apiVersion or kind"
            )));
        }
        let name = obj.metadata.name.clone().unwrap_or_default();

        let gvk = Gvk::from(types);
        let key = ObjectKey::new(obj.metadata.namespace.clone(), name);
        set.add(gvk, key, obj);
    }

    Ok(set)
}
