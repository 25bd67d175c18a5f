//! Helmfast CLI - locks deployed Helm releases to their rendered state

use clap::Parser;
use miette::{miette, IntoDiagnostic, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use helmfast_operator::OperatorOptions;

#[derive(Parser)]
#[command(name = "helmfast")]
#[command(version)]
#[command(about = "Pins the resources of deployed Helm releases to their rendered manifests", long_about = None)]
struct Cli {
    /// Kubeconfig file
    #[arg(short = 'k', long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace to watch for HelmReleases
    #[arg(short, long, env = "NAMESPACE")]
    namespace: String,

    /// Unique name identifying this controller; used as the field manager
    /// and owner tag on every object it applies
    #[arg(long, env = "CONTROLLER_NAME", default_value = "helmfast")]
    controller_name: String,

    /// Name of the node this controller is running on; attached to events
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Workers per workqueue
    #[arg(long, default_value_t = 50)]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if cli.namespace.trim().is_empty() {
        return Err(miette!(
            "helmfast can only be started in a single namespace; --namespace must not be empty"
        ));
    }

    helmfast_operator::run(OperatorOptions {
        kubeconfig: cli.kubeconfig,
        namespace: cli.namespace,
        controller_name: cli.controller_name,
        node_name: cli.node_name,
        workers: cli.workers,
    })
    .await
    .into_diagnostic()?;

    Ok(())
}
