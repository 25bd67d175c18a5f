//! The lockable object-set register
//!
//! In-memory store mapping release keys to tracked object sets, plus the
//! reverse ownership index used to resolve cluster events back to their
//! owning release. Every observable mutation publishes exactly one event on
//! a bounded channel consumed by the reconciler.
//!
//! Lock order is fixed: entry state first, ownership index second. `resolve`
//! sits on the watch hot path and only ever takes the index read lock. The
//! event pump on the consuming side must not call back into the register,
//! otherwise a full channel could deadlock against a held entry lock.

use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use helmfast_core::ReleaseKey;

use crate::error::{KubeError, Result};
use crate::gvk::Gvk;
use crate::objectset::{ObjectKey, ObjectSet};

/// Starts a watch on a GVK. Implemented by the dynamic GVK watcher; the
/// register only needs this one method, which breaks the construction cycle
/// between the two.
#[async_trait]
pub trait WatchGvk: Send + Sync {
    async fn watch(&self, gvk: &Gvk) -> Result<()>;
}

/// What happened to a tracked entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetEventKind {
    Added,
    Modified,
    Deleted,
}

/// Change event published by the register
#[derive(Debug, Clone)]
pub struct SetEvent {
    pub kind: SetEventKind,
    pub key: ReleaseKey,
    pub generation: u64,
    /// On Deleted: whether previously owned objects must be removed from the
    /// cluster. Always false otherwise.
    pub purge: bool,
    /// On Deleted: the entry's last-known GVKs, so the purge can scope its
    /// orphan search without a full server enumeration.
    pub gvks: Vec<Gvk>,
}

/// State tracked per release key
#[derive(Debug, Clone)]
pub struct TrackedEntry {
    pub objects: ObjectSet,
    /// locked: drift must be corrected. Unlocked entries keep their set for
    /// a later re-lock but are ignored by the reconciler.
    pub locked: bool,
    /// Bumped on every mutation; carries change ordering out of the register
    pub generation: u64,
    /// Stable set-identity tag, derived from the release key so a restarted
    /// process recovers ownership of previously applied objects
    pub identity: String,
}

struct RegisterInner {
    state: RwLock<HashMap<ReleaseKey, TrackedEntry>>,
    index: RwLock<HashMap<Gvk, HashMap<ObjectKey, ReleaseKey>>>,
    events: mpsc::Sender<SetEvent>,
    watcher: OnceLock<Arc<dyn WatchGvk>>,
}

/// In-memory register of lockable object sets. Cheap to clone; all clones
/// share state.
#[derive(Clone)]
pub struct LockableSetRegister {
    inner: Arc<RegisterInner>,
}

impl LockableSetRegister {
    /// Create a register and the receiving end of its event channel.
    ///
    /// The channel is bounded: producers block on backpressure rather than
    /// drop events, so drift is always resurfaced.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<SetEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                inner: Arc::new(RegisterInner {
                    state: RwLock::new(HashMap::new()),
                    index: RwLock::new(HashMap::new()),
                    events: tx,
                    watcher: OnceLock::new(),
                }),
            },
            rx,
        )
    }

    /// Attach the GVK watcher. Must happen before the first `lock`; separate
    /// from construction because the watcher itself needs the register.
    pub fn attach_watcher(&self, watcher: Arc<dyn WatchGvk>) {
        if self.inner.watcher.set(watcher).is_err() {
            warn!("gvk watcher attached twice; keeping the first");
        }
    }

    /// Lock an object set under a release key, replacing any previous set.
    ///
    /// Validates single-ownership first: if any object already belongs to a
    /// different key, fails with `OwnershipConflict` and mutates nothing.
    pub async fn lock(&self, key: &ReleaseKey, objects: ObjectSet) -> Result<()> {
        let mut state = self.inner.state.write().await;
        let mut index = self.inner.index.write().await;

        for (gvk, objs) in objects.iter_gvks() {
            if let Some(owned) = index.get(gvk) {
                for obj_key in objs.keys() {
                    if let Some(owner) = owned.get(obj_key) {
                        if owner != key {
                            return Err(KubeError::OwnershipConflict {
                                key: key.clone(),
                                owner: owner.clone(),
                                object: format!("{gvk} {obj_key}"),
                            });
                        }
                    }
                }
            }
        }

        remove_index_entries(&mut index, key);
        for (gvk, objs) in objects.iter_gvks() {
            let owned = index.entry(gvk.clone()).or_default();
            for obj_key in objs.keys() {
                owned.insert(obj_key.clone(), key.clone());
            }
        }
        drop(index);

        let gvks = objects.gvks();
        let (kind, generation) = match state.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.objects = objects;
                entry.locked = true;
                entry.generation += 1;
                (SetEventKind::Modified, entry.generation)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(TrackedEntry {
                    objects,
                    locked: true,
                    generation: 1,
                    identity: key.to_string(),
                });
                (SetEventKind::Added, 1)
            }
        };

        // Every GVK in a locked set must have a running informer. Watch
        // failures keep the lock in place; the affected kind reconciles on
        // the next event or relist.
        if let Some(watcher) = self.inner.watcher.get() {
            for gvk in &gvks {
                if let Err(err) = watcher.watch(gvk).await {
                    warn!(%gvk, %err, "failed to start watch for locked gvk");
                }
            }
        } else {
            warn!(%key, "no gvk watcher attached; locked set will not see drift events");
        }

        self.publish(SetEvent {
            kind,
            key: key.clone(),
            generation,
            purge: false,
            gvks,
        })
        .await;
        Ok(())
    }

    /// Stop enforcing a key's set while keeping it for diagnostics and a
    /// later re-lock. No-op if the key is untracked.
    pub async fn unlock(&self, key: &ReleaseKey) {
        let mut state = self.inner.state.write().await;
        let Some(entry) = state.get_mut(key) else {
            return;
        };
        entry.locked = false;
        entry.generation += 1;
        let generation = entry.generation;

        let mut index = self.inner.index.write().await;
        remove_index_entries(&mut index, key);
        drop(index);

        self.publish(SetEvent {
            kind: SetEventKind::Modified,
            key: key.clone(),
            generation,
            purge: false,
            gvks: Vec::new(),
        })
        .await;
    }

    /// Drop a key entirely. With `purge` the reconciler will delete every
    /// object the key still owns in the cluster; without it, resources are
    /// deliberately orphaned.
    pub async fn delete(&self, key: &ReleaseKey, purge: bool) {
        let mut state = self.inner.state.write().await;
        let Some(entry) = state.remove(key) else {
            return;
        };

        let mut index = self.inner.index.write().await;
        remove_index_entries(&mut index, key);
        drop(index);

        self.publish(SetEvent {
            kind: SetEventKind::Deleted,
            key: key.clone(),
            generation: entry.generation,
            purge,
            gvks: entry.objects.gvks(),
        })
        .await;
    }

    /// Publish a Modified event for a key without touching state. This is
    /// the drift path: a watched object changed, re-reconcile its owner.
    pub async fn enqueue(&self, namespace: &str, name: &str) {
        let key = ReleaseKey::new(namespace, name);
        let generation = {
            let state = self.inner.state.read().await;
            match state.get(&key) {
                Some(entry) => entry.generation,
                None => return,
            }
        };
        debug!(%key, "enqueuing tracked set");
        self.publish(SetEvent {
            kind: SetEventKind::Modified,
            key,
            generation,
            purge: false,
            gvks: Vec::new(),
        })
        .await;
    }

    /// Reverse-lookup the owner of a cluster object.
    ///
    /// Objects rendered without a namespace are indexed that way, so a live
    /// event's namespace is tried exactly and then without.
    pub async fn resolve(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        name: &str,
    ) -> Vec<ReleaseKey> {
        let index = self.inner.index.read().await;
        let Some(owned) = index.get(gvk) else {
            return Vec::new();
        };
        let exact = ObjectKey::new(namespace.map(str::to_string), name.to_string());
        if let Some(owner) = owned.get(&exact) {
            return vec![owner.clone()];
        }
        if namespace.is_some() {
            let bare = ObjectKey::new(None, name.to_string());
            if let Some(owner) = owned.get(&bare) {
                return vec![owner.clone()];
            }
        }
        Vec::new()
    }

    /// Snapshot of a tracked entry
    pub async fn get(&self, key: &ReleaseKey) -> Option<TrackedEntry> {
        self.inner.state.read().await.get(key).cloned()
    }

    async fn publish(&self, event: SetEvent) {
        if self.inner.events.send(event).await.is_err() {
            debug!("event channel closed; dropping register event");
        }
    }
}

fn remove_index_entries(index: &mut HashMap<Gvk, HashMap<ObjectKey, ReleaseKey>>, key: &ReleaseKey) {
    index.retain(|_, owned| {
        owned.retain(|_, owner| owner != key);
        !owned.is_empty()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectset::parser::parse;

    fn set_with(names: &[&str]) -> ObjectSet {
        let manifest = names
            .iter()
            .map(|n| {
                format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {n}\n  namespace: ns1\n")
            })
            .collect::<Vec<_>>()
            .join("---\n");
        parse(&manifest).unwrap()
    }

    fn cm_gvk() -> Gvk {
        Gvk::from_api_version("v1", "ConfigMap")
    }

    #[tokio::test]
    async fn test_lock_publishes_added_then_modified() {
        let (register, mut rx) = LockableSetRegister::new(8);
        let key = ReleaseKey::new("ns1", "rel-a");

        register.lock(&key, set_with(&["cm-x"])).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, SetEventKind::Added);
        assert_eq!(ev.generation, 1);
        assert!(!ev.purge);

        register.lock(&key, set_with(&["cm-x"])).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, SetEventKind::Modified);
        assert_eq!(ev.generation, 2);
    }

    #[tokio::test]
    async fn test_lock_is_idempotent_on_state() {
        let (register, _rx) = LockableSetRegister::new(8);
        let key = ReleaseKey::new("ns1", "rel-a");

        register.lock(&key, set_with(&["cm-x"])).await.unwrap();
        register.lock(&key, set_with(&["cm-x"])).await.unwrap();

        let entry = register.get(&key).await.unwrap();
        assert!(entry.locked);
        assert_eq!(entry.objects.len(), 1);
        assert_eq!(entry.identity, "ns1/rel-a");
        assert_eq!(
            register.resolve(&cm_gvk(), Some("ns1"), "cm-x").await,
            vec![key]
        );
    }

    #[tokio::test]
    async fn test_single_owner_conflict() {
        let (register, _rx) = LockableSetRegister::new(8);
        let first = ReleaseKey::new("ns1", "rel-a");
        let second = ReleaseKey::new("ns1", "rel-b");

        register.lock(&first, set_with(&["cm-x"])).await.unwrap();
        let err = register.lock(&second, set_with(&["cm-x"])).await.unwrap_err();
        match err {
            KubeError::OwnershipConflict { key, owner, .. } => {
                assert_eq!(key, second);
                assert_eq!(owner, first);
            }
            other => panic!("expected ownership conflict, got {other}"),
        }

        // losing lock mutated nothing: first still owns, second untracked
        assert_eq!(
            register.resolve(&cm_gvk(), Some("ns1"), "cm-x").await,
            vec![first]
        );
        assert!(register.get(&second).await.is_none());
    }

    #[tokio::test]
    async fn test_relock_releases_old_objects() {
        let (register, _rx) = LockableSetRegister::new(8);
        let key = ReleaseKey::new("ns1", "rel-a");

        register.lock(&key, set_with(&["cm-old"])).await.unwrap();
        register.lock(&key, set_with(&["cm-new"])).await.unwrap();

        assert!(register.resolve(&cm_gvk(), Some("ns1"), "cm-old").await.is_empty());
        assert_eq!(
            register.resolve(&cm_gvk(), Some("ns1"), "cm-new").await,
            vec![key.clone()]
        );

        // the freed object can now be claimed by another key
        let other = ReleaseKey::new("ns1", "rel-b");
        register.lock(&other, set_with(&["cm-old"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_keeps_set_but_clears_index() {
        let (register, mut rx) = LockableSetRegister::new(8);
        let key = ReleaseKey::new("ns1", "rel-a");

        register.lock(&key, set_with(&["cm-x"])).await.unwrap();
        rx.recv().await.unwrap();

        register.unlock(&key).await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, SetEventKind::Modified);

        let entry = register.get(&key).await.unwrap();
        assert!(!entry.locked);
        assert_eq!(entry.objects.len(), 1);
        assert!(register.resolve(&cm_gvk(), Some("ns1"), "cm-x").await.is_empty());

        // unlock twice behaves like unlock once, and untracked keys no-op
        register.unlock(&key).await;
        register.unlock(&ReleaseKey::new("ns9", "ghost")).await;
        assert!(!register.get(&key).await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_delete_carries_purge_and_gvks() {
        let (register, mut rx) = LockableSetRegister::new(8);
        let key = ReleaseKey::new("ns1", "rel-a");

        register.lock(&key, set_with(&["cm-x"])).await.unwrap();
        rx.recv().await.unwrap();

        register.delete(&key, true).await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, SetEventKind::Deleted);
        assert!(ev.purge);
        assert_eq!(ev.gvks, vec![cm_gvk()]);

        assert!(register.get(&key).await.is_none());
        assert!(register.resolve(&cm_gvk(), Some("ns1"), "cm-x").await.is_empty());

        // deleting an untracked key publishes nothing
        register.delete(&key, true).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_enqueue_publishes_without_mutation() {
        let (register, mut rx) = LockableSetRegister::new(8);
        let key = ReleaseKey::new("ns1", "rel-a");

        register.lock(&key, set_with(&["cm-x"])).await.unwrap();
        rx.recv().await.unwrap();
        let before = register.get(&key).await.unwrap().generation;

        register.enqueue("ns1", "rel-a").await;
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, SetEventKind::Modified);
        assert_eq!(ev.generation, before);
        assert_eq!(register.get(&key).await.unwrap().generation, before);

        // untracked keys do not produce events
        register.enqueue("ns9", "ghost").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_bare_key() {
        let (register, _rx) = LockableSetRegister::new(8);
        let key = ReleaseKey::new("ns1", "rel-a");
        // rendered without a namespace; live events will carry one
        let set = parse("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-x\n").unwrap();
        register.lock(&key, set).await.unwrap();

        assert_eq!(
            register.resolve(&cm_gvk(), Some("ns1"), "cm-x").await,
            vec![key]
        );
    }

    #[tokio::test]
    async fn test_watch_called_for_each_gvk() {
        use std::sync::Mutex;

        struct Recorder(Mutex<Vec<Gvk>>);

        #[async_trait]
        impl WatchGvk for Recorder {
            async fn watch(&self, gvk: &Gvk) -> Result<()> {
                self.0.lock().unwrap().push(gvk.clone());
                Ok(())
            }
        }

        let (register, _rx) = LockableSetRegister::new(8);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        register.attach_watcher(recorder.clone());

        let key = ReleaseKey::new("ns1", "rel-a");
        let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n  namespace: ns1\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: d\n  namespace: ns1\n";
        register.lock(&key, parse(manifest).unwrap()).await.unwrap();

        let mut seen = recorder.0.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                Gvk::from_api_version("apps/v1", "Deployment"),
                Gvk::from_api_version("v1", "ConfigMap"),
            ]
        );
    }
}
