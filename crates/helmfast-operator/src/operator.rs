//! Operator wiring
//!
//! Construction order matters: the register is built first with its event
//! channel, the GVK watcher is built against the register and then attached
//! to it, and only after every handler is in place do the loops start. A
//! deployment that wants a single active instance wraps everything past
//! construction in its leader-election callback; followers stay hot with
//! nothing started.

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use helmfast_kube::{
    ApiResolver, GvkLister, GvkWatcher, LockableSetRegister, SetApplier, SetReconciler,
    DEFAULT_WORKERS,
};

use crate::controller::ReleaseController;
use crate::error::{OperatorError, Result};

/// Size of the register's event channel; bursts beyond this block producers
/// rather than drop events
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct OperatorOptions {
    /// Explicit kubeconfig path; in-cluster or default chain otherwise
    pub kubeconfig: Option<PathBuf>,
    /// Namespace watched for HelmRelease resources
    pub namespace: String,
    /// Field-manager and owner-tag name for everything this instance writes
    pub controller_name: String,
    /// Node the controller runs on; attached to recorded events
    pub node_name: Option<String>,
    /// Worker count per workqueue
    pub workers: usize,
}

impl Default for OperatorOptions {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            namespace: String::new(),
            controller_name: "helmfast".to_string(),
            node_name: None,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl OperatorOptions {
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "helmfast can only be started in a single namespace; none provided".to_string(),
            ));
        }
        Ok(())
    }
}

/// Run the operator until the process receives a shutdown signal
pub async fn run(options: OperatorOptions) -> Result<()> {
    options.validate()?;

    let client = build_client(options.kubeconfig.as_deref()).await?;
    let resolver = Arc::new(ApiResolver::new(client.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (register, events) = LockableSetRegister::new(EVENT_BUFFER);
    let gvk_watcher = GvkWatcher::new(
        Arc::clone(&resolver),
        Arc::new(register.clone()),
        shutdown_rx.clone(),
    );
    register.attach_watcher(gvk_watcher.clone());

    let applier = SetApplier::new(
        Arc::clone(&resolver),
        GvkLister::new(client.clone()),
        options.controller_name.clone(),
    );
    let reconciler = SetReconciler::new(register.clone(), Arc::new(applier));

    let controller = ReleaseController::new(
        client,
        options.namespace.clone(),
        options.controller_name.clone(),
        options.node_name.clone(),
        register,
    );

    // everything registered; start the loops
    let reconciler_task = {
        let shutdown = shutdown_rx.clone();
        let workers = options.workers;
        tokio::spawn(async move {
            reconciler.run(events, workers, shutdown).await;
        })
    };
    let controller_task = {
        let shutdown = shutdown_rx.clone();
        let workers = options.workers;
        tokio::spawn(async move {
            controller.run(workers, shutdown).await;
        })
    };
    if let Err(err) = gvk_watcher.start().await {
        // per-GVK failures recover on the next lock of the affected kind
        warn!(%err, "some gvk watches failed to start");
    }

    info!(
        namespace = %options.namespace,
        controller = %options.controller_name,
        "helmfast started"
    );

    wait_for_signal().await?;
    info!("shutdown signal received; stopping");
    let _ = shutdown_tx.send(true);

    let _ = reconciler_task.await;
    let _ = controller_task.await;
    Ok(())
}

async fn build_client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let config =
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
            Ok(Client::try_from(config)?)
        }
        None => Ok(Client::try_default().await?),
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_require_namespace() {
        let options = OperatorOptions::default();
        assert!(options.validate().is_err());

        let options = OperatorOptions {
            namespace: "helmfast-system".to_string(),
            ..Default::default()
        };
        assert!(options.validate().is_ok());
    }
}
