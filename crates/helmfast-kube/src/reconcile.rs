//! Drift reconciliation worker pool
//!
//! Consumes the register's event channel through a rate-limited workqueue.
//! The pump that drains the channel into the queue never calls back into
//! the register, so producers blocked on channel backpressure can always
//! make progress. Workers serialise per key through the queue's in-flight
//! guard and run concurrently across keys.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info};

use helmfast_core::ReleaseKey;

use crate::apply::ApplySet;
use crate::error::Result;
use crate::gvk::Gvk;
use crate::register::{LockableSetRegister, SetEvent, SetEventKind};
use crate::workqueue::{default_rate_limiter, Workqueue};

/// Default worker pool size per queue
pub const DEFAULT_WORKERS: usize = 50;

#[derive(Debug, Clone)]
struct PendingPurge {
    gvks: Vec<Gvk>,
}

/// Converges the cluster on the register's tracked state
pub struct SetReconciler {
    register: LockableSetRegister,
    applier: Arc<dyn ApplySet>,
    pending: Mutex<HashMap<ReleaseKey, PendingPurge>>,
}

impl SetReconciler {
    pub fn new(register: LockableSetRegister, applier: Arc<dyn ApplySet>) -> Arc<Self> {
        Arc::new(Self {
            register,
            applier,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Drive reconciliation until the event channel closes or shutdown is
    /// signalled. Spawns `workers` draining tasks plus the channel pump.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SetEvent>,
        workers: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let queue = Workqueue::new(default_rate_limiter::<ReleaseKey>());

        let pump = {
            let this = Arc::clone(&self);
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        event = events.recv() => match event {
                            Some(event) => {
                                this.observe(&event).await;
                                queue.add(event.key);
                            }
                            None => break,
                        }
                    }
                }
                queue.shutdown();
            })
        };

        let mut worker_tasks = Vec::with_capacity(workers);
        for _ in 0..workers {
            let this = Arc::clone(&self);
            let queue = Arc::clone(&queue);
            worker_tasks.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    match this.reconcile_key(&key).await {
                        Ok(()) => queue.forget(&key),
                        Err(err) if err.is_conflict() => {
                            debug!(%key, "apply conflict; requeueing");
                            queue.add_rate_limited(key.clone());
                        }
                        Err(err) => {
                            error!(%key, %err, "failed to reconcile object set; requeueing");
                            queue.add_rate_limited(key.clone());
                        }
                    }
                    queue.done(&key);
                }
            }));
        }

        let _ = pump.await;
        for task in worker_tasks {
            let _ = task.await;
        }
    }

    /// Record the parts of an event the entry itself can no longer tell us
    async fn observe(&self, event: &SetEvent) {
        if event.kind != SetEventKind::Deleted {
            return;
        }
        let mut pending = self.pending.lock().await;
        if event.purge {
            pending.insert(
                event.key.clone(),
                PendingPurge {
                    gvks: event.gvks.clone(),
                },
            );
        } else {
            pending.remove(&event.key);
        }
    }

    async fn reconcile_key(&self, key: &ReleaseKey) -> Result<()> {
        match self.register.get(key).await {
            Some(entry) if entry.locked => {
                let gvks = entry.objects.gvks();
                self.applier
                    .apply_set(key, &entry.identity, Some(&entry.objects), &gvks)
                    .await?;
                info!(%key, objects = entry.objects.len(), "applied object set");
                Ok(())
            }
            // unlocked: drift is deliberately ignored
            Some(_) => Ok(()),
            None => {
                let purge = self.pending.lock().await.get(key).cloned();
                match purge {
                    Some(pending) => {
                        // identity derives from the key, so a purge can be
                        // composed without the deleted entry
                        self.applier
                            .apply_set(key, &key.to_string(), None, &pending.gvks)
                            .await?;
                        self.pending.lock().await.remove(key);
                        info!(%key, "purged object set");
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectset::parser::parse;
    use crate::objectset::ObjectSet;
    use async_trait::async_trait;

    #[derive(Debug, Clone, PartialEq)]
    struct RecordedApply {
        key: ReleaseKey,
        identity: String,
        desired_len: Option<usize>,
        known_gvks: Vec<Gvk>,
    }

    struct RecordingApplier(std::sync::Mutex<Vec<RecordedApply>>);

    impl RecordingApplier {
        fn new() -> Arc<Self> {
            Arc::new(Self(std::sync::Mutex::new(Vec::new())))
        }

        fn calls(&self) -> Vec<RecordedApply> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ApplySet for RecordingApplier {
        async fn apply_set(
            &self,
            key: &ReleaseKey,
            identity: &str,
            desired: Option<&ObjectSet>,
            known_gvks: &[Gvk],
        ) -> Result<()> {
            self.0.lock().unwrap().push(RecordedApply {
                key: key.clone(),
                identity: identity.to_string(),
                desired_len: desired.map(ObjectSet::len),
                known_gvks: known_gvks.to_vec(),
            });
            Ok(())
        }
    }

    fn cm_set() -> ObjectSet {
        parse("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-x\n  namespace: ns1\n")
            .unwrap()
    }

    #[tokio::test]
    async fn test_locked_entry_is_applied() {
        let (register, _rx) = LockableSetRegister::new(8);
        let applier = RecordingApplier::new();
        let reconciler = SetReconciler::new(register.clone(), applier.clone());

        let key = ReleaseKey::new("ns1", "rel-a");
        register.lock(&key, cm_set()).await.unwrap();

        reconciler.reconcile_key(&key).await.unwrap();
        let calls = applier.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].key, key);
        assert_eq!(calls[0].identity, "ns1/rel-a");
        assert_eq!(calls[0].desired_len, Some(1));
    }

    #[tokio::test]
    async fn test_unlocked_entry_is_left_alone() {
        let (register, _rx) = LockableSetRegister::new(8);
        let applier = RecordingApplier::new();
        let reconciler = SetReconciler::new(register.clone(), applier.clone());

        let key = ReleaseKey::new("ns1", "rel-a");
        register.lock(&key, cm_set()).await.unwrap();
        register.unlock(&key).await;

        reconciler.reconcile_key(&key).await.unwrap();
        assert!(applier.calls().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_with_purge_applies_empty_set() {
        let (register, mut rx) = LockableSetRegister::new(8);
        let applier = RecordingApplier::new();
        let reconciler = SetReconciler::new(register.clone(), applier.clone());

        let key = ReleaseKey::new("ns1", "rel-a");
        register.lock(&key, cm_set()).await.unwrap();
        register.delete(&key, true).await;

        // feed the reconciler what the pump would have seen
        while let Ok(event) = rx.try_recv() {
            reconciler.observe(&event).await;
        }

        reconciler.reconcile_key(&key).await.unwrap();
        let calls = applier.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].desired_len, None);
        assert_eq!(calls[0].identity, "ns1/rel-a");
        assert_eq!(calls[0].known_gvks, vec![Gvk::from_api_version("v1", "ConfigMap")]);

        // purge handled exactly once
        reconciler.reconcile_key(&key).await.unwrap();
        assert_eq!(applier.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_without_purge_is_a_no_op() {
        let (register, mut rx) = LockableSetRegister::new(8);
        let applier = RecordingApplier::new();
        let reconciler = SetReconciler::new(register.clone(), applier.clone());

        let key = ReleaseKey::new("ns1", "rel-a");
        register.lock(&key, cm_set()).await.unwrap();
        register.delete(&key, false).await;

        while let Ok(event) = rx.try_recv() {
            reconciler.observe(&event).await;
        }

        reconciler.reconcile_key(&key).await.unwrap();
        assert!(applier.calls().is_empty());
    }

    #[tokio::test]
    async fn test_untracked_key_is_a_no_op() {
        let (register, _rx) = LockableSetRegister::new(8);
        let applier = RecordingApplier::new();
        let reconciler = SetReconciler::new(register, applier.clone());

        reconciler
            .reconcile_key(&ReleaseKey::new("ns9", "ghost"))
            .await
            .unwrap();
        assert!(applier.calls().is_empty());
    }
}
