//! Object sets: rendered cluster objects grouped as a single unit of ownership

pub mod parser;

use kube::api::DynamicObject;
use std::collections::HashMap;
use std::fmt;

use crate::gvk::Gvk;

/// Cluster-unique identity of an object within a GVK
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// None for cluster-scoped objects or documents rendered without one
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A collection of rendered cluster objects, keyed by GVK then object key.
///
/// Insertion order is irrelevant and iteration order is not stable.
#[derive(Debug, Clone, Default)]
pub struct ObjectSet {
    by_gvk: HashMap<Gvk, HashMap<ObjectKey, DynamicObject>>,
    len: usize,
}

impl ObjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object under the given GVK, replacing any previous object with
    /// the same key.
    pub fn add(&mut self, gvk: Gvk, key: ObjectKey, obj: DynamicObject) {
        let replaced = self.by_gvk.entry(gvk).or_default().insert(key, obj);
        if replaced.is_none() {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The GVKs present in this set
    pub fn gvks(&self) -> Vec<Gvk> {
        self.by_gvk.keys().cloned().collect()
    }

    /// Iterate per-GVK object maps
    pub fn iter_gvks(&self) -> impl Iterator<Item = (&Gvk, &HashMap<ObjectKey, DynamicObject>)> {
        self.by_gvk.iter()
    }

    /// Iterate every object with its GVK and key
    pub fn iter(&self) -> impl Iterator<Item = (&Gvk, &ObjectKey, &DynamicObject)> {
        self.by_gvk
            .iter()
            .flat_map(|(gvk, objs)| objs.iter().map(move |(key, obj)| (gvk, key, obj)))
    }

    pub fn contains(&self, gvk: &Gvk, key: &ObjectKey) -> bool {
        self.by_gvk.get(gvk).is_some_and(|objs| objs.contains_key(key))
    }
}
