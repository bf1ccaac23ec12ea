use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use k8s_openapi::api::coordination::v1::Lease;
use mcs_api::labels::CONTROLLER_NAME;
use mcs_cluster::{ClusterClient, ClusterRole, LocalCluster, ParentCluster};
use mcs_core::KubeStore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod backoff;
mod export_controller;
mod import_controller;
mod leader;
mod metrics;
mod probes;
mod service_ip_controller;
#[cfg(test)]
mod testing;

use backoff::ErrorBackoff;
use export_controller::{ExportContext, ExportController};
use import_controller::{ImportContext, ImportController};
use leader::{LeaderElector, LeaderGuard};
use metrics::ReconcileMetrics;
use probes::Readiness;
use service_ip_controller::{ServiceIpContext, ServiceIpController};

/// Requeue interval after a successful reconcile
pub(crate) const REQUEUE_AFTER: Duration = Duration::from_secs(300);

/// Relays Services between member clusters through a parent control plane
#[derive(Parser, Debug)]
#[command(name = "mcs-controller", version, about)]
struct Cli {
    /// Identifier of this cluster's connection to the parent
    #[arg(long, env = "MCS_AGENT_ID")]
    agent_id: String,

    /// Kubeconfig of the local cluster (in-cluster config when unset)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig of the parent control plane
    #[arg(long, env = "MCS_PARENT_KUBECONFIG")]
    parent_kubeconfig: PathBuf,

    /// Address the probe and metrics listeners bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind_address: IpAddr,

    #[arg(long, default_value_t = 8081)]
    health_check_port: u16,

    #[arg(long, default_value_t = 8080)]
    metrics_port: u16,

    /// Concurrent reconciles per controller
    #[arg(long, default_value_t = 4)]
    workers: u16,

    /// Run the controllers only while holding the leader lease
    #[arg(long)]
    leader_elect: bool,

    #[arg(long, env = "POD_NAMESPACE", default_value = "mcs-system")]
    leader_elect_namespace: String,

    #[arg(long, default_value = "mcs-controller-leader")]
    leader_elect_lease_name: String,

    /// Lease holder identity (random when unset)
    #[arg(long, env = "POD_NAME")]
    leader_elect_identity: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn leadership_lost(guard: &mut Option<LeaderGuard>) {
    match guard {
        Some(guard) => guard.lost().await,
        None => futures::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!(agent = %cli.agent_id, "Starting mcs-controller...");

    let local = ClusterClient::connect(ClusterRole::Local, cli.kubeconfig.as_deref()).await?;
    let parent =
        ClusterClient::connect(ClusterRole::Parent, Some(cli.parent_kubeconfig.as_path())).await?;

    let metrics = Arc::new(ReconcileMetrics::new()?);
    let readiness = Readiness::default();

    let health_addr = SocketAddr::new(cli.bind_address, cli.health_check_port);
    let health = readiness.clone();
    tokio::spawn(async move {
        let handler = move |path: &str| probes::health_response(path, &health);
        if let Err(e) = probes::serve(health_addr, handler).await {
            error!("Health listener error: {:#}", e);
        }
    });

    let metrics_addr = SocketAddr::new(cli.bind_address, cli.metrics_port);
    let served = metrics.clone();
    tokio::spawn(async move {
        let handler = move |path: &str| probes::metrics_response(path, &served);
        if let Err(e) = probes::serve(metrics_addr, handler).await {
            error!("Metrics listener error: {:#}", e);
        }
    });

    let mut guard = if cli.leader_elect {
        let identity = cli
            .leader_elect_identity
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let elector = Arc::new(LeaderElector::new(
            Arc::new(KubeStore::<Lease>::new(local.clone_client(), CONTROLLER_NAME)),
            &cli.leader_elect_namespace,
            &cli.leader_elect_lease_name,
            &identity,
        ));
        Some(elector.acquire().await)
    } else {
        None
    };

    let local_stores = LocalCluster::from_client(local.clone_client());
    let parent_stores = ParentCluster::from_client(parent.clone_client());

    let export = ExportController::new(
        local.clone_client(),
        ExportContext {
            agent_id: cli.agent_id.clone(),
            local: local_stores.clone(),
            parent: parent_stores.clone(),
            backoff: ErrorBackoff::default(),
        },
        metrics.clone(),
        cli.workers,
    );
    let import = ImportController::new(
        local.clone_client(),
        parent.clone_client(),
        ImportContext {
            local: local_stores.clone(),
            parent: parent_stores,
            backoff: ErrorBackoff::default(),
        },
        metrics.clone(),
        cli.workers,
    );
    let service_ip = ServiceIpController::new(
        local.clone_client(),
        ServiceIpContext {
            local: local_stores,
            backoff: ErrorBackoff::default(),
        },
        metrics,
        cli.workers,
    );

    readiness.set_ready(true);

    tokio::select! {
        result = async { tokio::try_join!(export.run(), import.run(), service_ip.run()) } => {
            result?;
            info!("Controllers stopped");
        }
        _ = leadership_lost(&mut guard) => {
            readiness.set_ready(false);
            bail!("leadership lost");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting...");
        }
    }

    Ok(())
}
