//! Dynamic per-GVK watchers
//!
//! Each GVK tracked by a locked set gets its own watcher task over
//! `Api<DynamicObject>`, translating cluster events into owner lookups and
//! release-key enqueues on the register. Watches are recorded lazily before
//! `start` and spawned eagerly after it; `start` may be called once.

use async_trait::async_trait;
use futures::TryStreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::watcher::{self, Event};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use helmfast_core::ReleaseKey;

use crate::error::{KubeError, Result};
use crate::gvk::{ApiResolver, Gvk};
use crate::register::{LockableSetRegister, WatchGvk};

/// The register-side surface the watcher needs: reverse ownership lookup
/// and drift enqueue. Kept narrow so the watcher can be built against a
/// register that was constructed first.
#[async_trait]
pub trait OwnerResolver: Send + Sync {
    async fn resolve(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Vec<ReleaseKey>;
    async fn enqueue(&self, namespace: &str, name: &str);
}

#[async_trait]
impl OwnerResolver for LockableSetRegister {
    async fn resolve(&self, gvk: &Gvk, namespace: Option<&str>, name: &str) -> Vec<ReleaseKey> {
        LockableSetRegister::resolve(self, gvk, namespace, name).await
    }

    async fn enqueue(&self, namespace: &str, name: &str) {
        LockableSetRegister::enqueue(self, namespace, name).await;
    }
}

struct WatchState {
    started: bool,
    registered: HashSet<Gvk>,
    running: HashSet<Gvk>,
}

/// Lazily starts one watcher task per GVK and keeps them keyed by the
/// GVK triple.
pub struct GvkWatcher {
    resolver: Arc<ApiResolver>,
    owners: Arc<dyn OwnerResolver>,
    shutdown: watch::Receiver<bool>,
    state: Mutex<WatchState>,
}

impl GvkWatcher {
    pub fn new(
        resolver: Arc<ApiResolver>,
        owners: Arc<dyn OwnerResolver>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            owners,
            shutdown,
            state: Mutex::new(WatchState {
                started: false,
                registered: HashSet::new(),
                running: HashSet::new(),
            }),
        })
    }

    /// Start every recorded GVK and switch to eager mode, where subsequent
    /// `watch` calls spawn immediately. Callable at most once.
    ///
    /// A GVK that fails to start does not abort the others; the aggregate
    /// failure is returned.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.started {
            return Err(KubeError::AlreadyStarted("gvk watcher"));
        }
        state.started = true;

        let mut failures = Vec::new();
        for gvk in state.registered.clone() {
            if state.running.contains(&gvk) {
                continue;
            }
            match self.start_gvk(&gvk).await {
                Ok(()) => {
                    state.running.insert(gvk);
                }
                Err(err) => failures.push(format!("{gvk}: {err}")),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(KubeError::WatchStart(failures.join("; ")))
        }
    }

    async fn start_gvk(&self, gvk: &Gvk) -> Result<()> {
        let (ar, _) = self.resolver.resolve(gvk).await?;
        let api: Api<DynamicObject> = Api::all_with(self.resolver.client(), &ar);
        tokio::spawn(run_watch(
            api,
            gvk.clone(),
            Arc::clone(&self.owners),
            self.shutdown.clone(),
        ));
        Ok(())
    }
}

#[async_trait]
impl WatchGvk for GvkWatcher {
    /// Idempotent: the first call for a GVK records it (and starts it if the
    /// watcher is running); later calls are no-ops.
    async fn watch(&self, gvk: &Gvk) -> Result<()> {
        let mut state = self.state.lock().await;
        state.registered.insert(gvk.clone());
        if state.started && !state.running.contains(gvk) {
            self.start_gvk(gvk).await?;
            state.running.insert(gvk.clone());
        }
        Ok(())
    }
}

async fn run_watch(
    api: Api<DynamicObject>,
    gvk: Gvk,
    owners: Arc<dyn OwnerResolver>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = 1u64;
    loop {
        if *shutdown.borrow() {
            return;
        }
        debug!(%gvk, "opening watch stream");
        let stream = watcher::watcher(api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                event = stream.try_next() => match event {
                    Ok(Some(Event::Applied(obj))) | Ok(Some(Event::Deleted(obj))) => {
                        backoff = 1;
                        notify_owner(&gvk, &owners, &obj).await;
                    }
                    Ok(Some(Event::Restarted(objs))) => {
                        backoff = 1;
                        for obj in &objs {
                            notify_owner(&gvk, &owners, obj).await;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%gvk, error = %err, "watch stream error; restarting");
                        break;
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(backoff.min(30))).await;
        backoff = (backoff * 2).min(30);
    }
}

async fn notify_owner(gvk: &Gvk, owners: &Arc<dyn OwnerResolver>, obj: &DynamicObject) {
    let Some(name) = obj.metadata.name.as_deref() else {
        return;
    };
    let namespace = obj.metadata.namespace.as_deref();
    for key in owners.resolve(gvk, namespace, name).await {
        debug!(%gvk, object = name, owner = %key, "tracked object changed");
        owners.enqueue(&key.namespace, &key.name).await;
    }
}
