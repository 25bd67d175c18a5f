//! The HelmRelease controller
//!
//! Watches HelmRelease resources in the configured system namespace and
//! Helm release secrets in every namespace; a secret's target namespace is
//! the release's own, not the CR's. A secret event is translated through
//! the release-key index into an enqueue of every CR pointing at that
//! release, and a worker pool reconciles CRs against the register.

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::watcher::{self, Event as WatchEvent};
use kube::{Client, Resource};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use helmfast_core::{ReleaseKey, HELM_SECRET_TYPE};
use helmfast_kube::objectset::parser;
use helmfast_kube::workqueue::{default_rate_limiter, Workqueue};
use helmfast_kube::{KeyedLock, KubeError, LockableSetRegister, ReleaseReader, Result};

use crate::crd::{Condition, HelmRelease, HelmReleaseStatus, ReleaseState};
use crate::info::ReleaseView;

/// Index from release key to the HelmRelease resources pointing at it.
///
/// CRs live in a single namespace, so their name is enough of a handle. A
/// CR whose spec moves to a different release is re-indexed, dropping the
/// old binding.
#[derive(Default)]
struct ReleaseIndex {
    bound: RwLock<HashMap<String, String>>,
    by_key: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl ReleaseIndex {
    async fn insert(&self, cr_name: &str, release_key: &str) {
        let mut bound = self.bound.write().await;
        let mut by_key = self.by_key.write().await;
        if let Some(old) = bound.insert(cr_name.to_string(), release_key.to_string()) {
            if old != release_key {
                if let Some(names) = by_key.get_mut(&old) {
                    names.remove(cr_name);
                    if names.is_empty() {
                        by_key.remove(&old);
                    }
                }
            }
        }
        by_key
            .entry(release_key.to_string())
            .or_default()
            .insert(cr_name.to_string());
    }

    async fn remove(&self, cr_name: &str) {
        let mut bound = self.bound.write().await;
        let mut by_key = self.by_key.write().await;
        if let Some(key) = bound.remove(cr_name) {
            if let Some(names) = by_key.get_mut(&key) {
                names.remove(cr_name);
                if names.is_empty() {
                    by_key.remove(&key);
                }
            }
        }
    }

    async fn get(&self, release_key: &str) -> Vec<String> {
        self.by_key
            .read()
            .await
            .get(release_key)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// A removed CR whose last observed state is one of these was not tracking
/// anything, so there is nothing to drop from the register.
fn was_tracking(state: ReleaseState) -> bool {
    !matches!(state, ReleaseState::SecretNotFound | ReleaseState::Uninstalled)
}

struct ControllerInner {
    client: Client,
    system_namespace: String,
    controller_name: String,
    node_name: Option<String>,
    reader: ReleaseReader,
    register: LockableSetRegister,
    keyed: KeyedLock<ReleaseKey>,
    index: ReleaseIndex,
    queue: Arc<Workqueue<String>>,
}

/// Watches HelmRelease resources and mediates between release records and
/// the object-set register. Cheap to clone.
#[derive(Clone)]
pub struct ReleaseController {
    inner: Arc<ControllerInner>,
}

impl ReleaseController {
    pub fn new(
        client: Client,
        system_namespace: impl Into<String>,
        controller_name: impl Into<String>,
        node_name: Option<String>,
        register: LockableSetRegister,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                reader: ReleaseReader::new(client.clone()),
                client,
                system_namespace: system_namespace.into(),
                controller_name: controller_name.into(),
                node_name,
                register,
                keyed: KeyedLock::new(),
                index: ReleaseIndex::default(),
                queue: Workqueue::new(default_rate_limiter::<String>()),
            }),
        }
    }

    /// Run the watch streams and the worker pool until shutdown
    pub async fn run(&self, workers: usize, shutdown: watch::Receiver<bool>) {
        let mut tasks = Vec::new();

        {
            let this = self.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                this.watch_releases(shutdown).await;
            }));
        }
        {
            let this = self.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                this.watch_secrets(shutdown).await;
            }));
        }
        {
            // the queue ends the workers once the shutdown signal fires
            let this = self.clone();
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                this.inner.queue.shutdown();
            }));
        }
        for _ in 0..workers {
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                this.worker_loop().await;
            }));
        }

        for task in tasks {
            let _ = task.await;
        }
    }

    fn releases_api(&self) -> Api<HelmRelease> {
        Api::namespaced(self.inner.client.clone(), &self.inner.system_namespace)
    }

    async fn watch_releases(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = 1u64;
        loop {
            if *shutdown.borrow() {
                return;
            }
            let stream = watcher::watcher(self.releases_api(), watcher::Config::default());
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    event = stream.try_next() => match event {
                        Ok(Some(WatchEvent::Applied(cr))) => {
                            backoff = 1;
                            self.observe_release(&cr).await;
                        }
                        Ok(Some(WatchEvent::Deleted(cr))) => {
                            backoff = 1;
                            if let Some(name) = cr.metadata.name.as_deref() {
                                self.inner.index.remove(name).await;
                            }
                            self.on_remove(&cr).await;
                        }
                        Ok(Some(WatchEvent::Restarted(crs))) => {
                            backoff = 1;
                            for cr in &crs {
                                self.observe_release(cr).await;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "helmrelease watch error; restarting");
                            break;
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(backoff.min(30))).await;
            backoff = (backoff * 2).min(30);
        }
    }

    async fn watch_secrets(&self, mut shutdown: watch::Receiver<bool>) {
        let api: Api<Secret> = Api::all(self.inner.client.clone());
        let config = watcher::Config::default().fields(&format!("type={HELM_SECRET_TYPE}"));
        let mut backoff = 1u64;
        loop {
            if *shutdown.borrow() {
                return;
            }
            let stream = watcher::watcher(api.clone(), config.clone());
            futures::pin_mut!(stream);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    event = stream.try_next() => match event {
                        Ok(Some(WatchEvent::Applied(secret)))
                        | Ok(Some(WatchEvent::Deleted(secret))) => {
                            backoff = 1;
                            self.observe_secret(&secret).await;
                        }
                        Ok(Some(WatchEvent::Restarted(secrets))) => {
                            backoff = 1;
                            for secret in &secrets {
                                self.observe_secret(secret).await;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "release secret watch error; restarting");
                            break;
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(backoff.min(30))).await;
            backoff = (backoff * 2).min(30);
        }
    }

    async fn observe_release(&self, cr: &HelmRelease) {
        let Some(name) = cr.metadata.name.as_deref() else {
            return;
        };
        self.inner
            .index
            .insert(name, &cr.release_key().to_string())
            .await;
        self.inner.queue.add(name.to_string());
    }

    /// Cross-watch: a release secret changed, enqueue every CR pointing at
    /// the same release key
    async fn observe_secret(&self, secret: &Secret) {
        let Some(key) = helmfast_kube::release_key_from_secret(secret) else {
            return;
        };
        for cr_name in self.inner.index.get(&key.to_string()).await {
            debug!(release = %key, cr = %cr_name, "release secret changed; enqueuing");
            self.inner.queue.add(cr_name);
        }
    }

    async fn worker_loop(&self) {
        while let Some(name) = self.inner.queue.get().await {
            let outcome = match self.releases_api().get_opt(&name).await {
                // gone between enqueue and processing; the Deleted watch
                // event carries the final object and handles removal
                Ok(None) => Ok(()),
                Ok(Some(cr)) => self.on_change(&cr).await,
                Err(err) => Err(KubeError::Api(err)),
            };
            match outcome {
                Ok(()) => self.inner.queue.forget(&name),
                Err(err) => {
                    error!(cr = %name, %err, "failed to reconcile HelmRelease; requeueing");
                    self.inner.queue.add_rate_limited(name.clone());
                }
            }
            self.inner.queue.done(&name);
        }
    }

    /// Reconcile one HelmRelease against its stored release record
    async fn on_change(&self, cr: &HelmRelease) -> Result<()> {
        if cr.metadata.namespace.as_deref() != Some(self.inner.system_namespace.as_str()) {
            return Ok(());
        }
        if cr.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }
        let Some(cr_name) = cr.metadata.name.as_deref() else {
            return Ok(());
        };

        let key = cr.release_key();
        let _guard = self.inner.keyed.lock(&key).await;
        let mut status = cr.status.clone().unwrap_or_default();

        let release = match self.inner.reader.last(&key).await {
            Ok(release) => release,
            Err(err @ KubeError::SecretNotFound { .. }) => {
                info!(release = %key, cr = cr_name, "release secret gone; purging tracked objects");
                status.state = ReleaseState::SecretNotFound;
                status.version = None;
                status.description = None;
                status.notes = None;
                status.conditions =
                    vec![Condition::now("Ready", "False", "SecretNotFound", err.to_string())];
                self.update_status(cr_name, &status).await?;
                self.inner.register.delete(&key, true).await;
                self.record(cr, EventType::Warning, "SecretNotFound", err.to_string())
                    .await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let view = ReleaseView::from(&release);
        view.apply_to(&mut status);

        if !view.locked() {
            info!(release = %key, status = %release.status, "release is not deployed; unlocking");
            status.conditions = vec![Condition::now(
                "Ready",
                "False",
                "NotDeployed",
                format!("release status is {}", release.status),
            )];
            self.update_status(cr_name, &status).await?;
            self.inner.register.unlock(&key).await;
            self.record(
                cr,
                EventType::Normal,
                "Unlocked",
                format!("release {key} is {}; drift is no longer corrected", release.status),
            )
            .await;
            return Ok(());
        }

        let objects = match parser::parse(&release.manifest) {
            Ok(objects) => objects,
            Err(err) => {
                status.state = ReleaseState::Error;
                status.conditions =
                    vec![Condition::now("Ready", "False", "ParseError", err.to_string())];
                self.update_status(cr_name, &status).await?;
                // recoverable: the next revision may render a valid manifest
                return Err(err);
            }
        };

        info!(release = %key, version = release.version, objects = objects.len(), "locking release");
        match self.inner.register.lock(&key, objects).await {
            Ok(()) => {
                status.conditions =
                    vec![Condition::now("Ready", "True", "Locked", "object set locked")];
                self.update_status(cr_name, &status).await?;
                self.record(
                    cr,
                    EventType::Normal,
                    "Locked",
                    format!("locked release {key} at version {}", release.version),
                )
                .await;
                Ok(())
            }
            Err(err @ KubeError::OwnershipConflict { .. }) => {
                status.state = ReleaseState::Error;
                status.conditions = vec![Condition::now(
                    "Ready",
                    "False",
                    "OwnershipConflict",
                    err.to_string(),
                )];
                self.update_status(cr_name, &status).await?;
                self.record(cr, EventType::Warning, "OwnershipConflict", err.to_string())
                    .await;
                // retrying cannot help until the conflicting owner lets go
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Handle CR removal. The pointer resource going away must not
    /// uninstall the application, so nothing is purged.
    async fn on_remove(&self, cr: &HelmRelease) {
        let key = cr.release_key();
        let last = cr.status.as_ref().map(|s| s.state).unwrap_or_default();
        if !was_tracking(last) {
            debug!(release = %key, "removed HelmRelease tracked nothing; ignoring");
            return;
        }
        let _guard = self.inner.keyed.lock(&key).await;
        self.inner.register.delete(&key, false).await;
        warn!(
            release = %key,
            "HelmRelease removed; resources for the release remain in the cluster"
        );
    }

    async fn update_status(&self, cr_name: &str, status: &HelmReleaseStatus) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.releases_api()
            .patch_status(cr_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn record(&self, cr: &HelmRelease, type_: EventType, reason: &str, note: String) {
        let reporter = Reporter {
            controller: self.inner.controller_name.clone(),
            instance: self.inner.node_name.clone(),
        };
        let recorder = Recorder::new(self.inner.client.clone(), reporter, cr.object_ref(&()));
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(err) = recorder.publish(event).await {
            debug!(%err, "failed to publish event");
        }
    }
}
