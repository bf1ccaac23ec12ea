//! Service controller: writes the cluster IP of a derived Service back into its ServiceImport

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::controller::{Action, Config, Error as ControllerError};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use kube_runtime::Controller;
use mcs_api::ServiceImport;
use mcs_cluster::LocalCluster;
use mcs_core::{CoreError, Result};
use tracing::{debug, info, instrument, warn};

use crate::backoff::ErrorBackoff;
use crate::metrics::{self, ReconcileMetrics};

const CONTROLLER: &str = "service-ip";

pub struct ServiceIpContext {
    pub local: LocalCluster,
    pub backoff: ErrorBackoff,
}

pub struct ServiceIpController {
    client: Client,
    ctx: Arc<ServiceIpContext>,
    metrics: Arc<ReconcileMetrics>,
    workers: u16,
}

impl ServiceIpController {
    pub fn new(
        client: Client,
        ctx: ServiceIpContext,
        metrics: Arc<ReconcileMetrics>,
        workers: u16,
    ) -> Self {
        Self {
            client,
            ctx: Arc::new(ctx),
            metrics,
            workers,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Starting Service IP propagation");

        let services: Api<Service> = Api::all(self.client.clone());

        let mut stream = Controller::new(services, watcher::Config::default())
            .with_config(Config::default().concurrency(self.workers))
            .run(reconcile, error_policy, self.ctx.clone())
            .boxed();

        while let Some(item) = stream.next().await {
            match item {
                Ok((service, _)) => {
                    self.ctx.backoff.reset(&service.to_string());
                    self.metrics.record(CONTROLLER, metrics::SUCCESS);
                }
                Err(e) => {
                    // a requeued object that has since been deleted
                    if let ControllerError::ObjectNotFound(gone) = &e {
                        self.ctx.backoff.reset(&gone.to_string());
                    }
                    warn!(error = %e, "Service reconciliation failed");
                    self.metrics.record(CONTROLLER, metrics::ERROR);
                }
            }
        }

        Ok(())
    }
}

/// Name of the ServiceImport owning `service`, if any
pub fn import_owner(service: &Service) -> Option<&str> {
    let kind = ServiceImport::kind(&());
    let api_version = ServiceImport::api_version(&());
    service
        .owner_references()
        .iter()
        .find(|owner| owner.kind == kind && owner.api_version == api_version)
        .map(|owner| owner.name.as_str())
}

/// Assigned cluster IP; headless and unallocated Services have none
pub fn cluster_ip(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != "None")
}

#[instrument(
    skip_all,
    fields(namespace = %service.namespace().unwrap_or_default(), name = %service.name_any())
)]
pub async fn reconcile(service: Arc<Service>, ctx: Arc<ServiceIpContext>) -> Result<Action> {
    let Some(import_name) = import_owner(&service) else {
        return Ok(Action::await_change());
    };
    let namespace = service
        .namespace()
        .ok_or(CoreError::MissingField("metadata.namespace"))?;

    let Some(mut import) = ctx.local.imports.get(&namespace, import_name).await? else {
        debug!(import = %import_name, "Owning ServiceImport is gone");
        return Ok(Action::await_change());
    };
    if !import.spec.ips.is_empty() {
        return Ok(Action::await_change());
    }
    let Some(ip) = cluster_ip(&service) else {
        debug!("No cluster IP assigned yet");
        return Ok(Action::await_change());
    };

    import.spec.ips = vec![ip.to_string()];
    ctx.local.imports.replace(&import).await?;
    info!(import = %import_name, %ip, "Recorded cluster IP on ServiceImport");

    Ok(Action::await_change())
}

pub fn error_policy(
    service: Arc<Service>,
    error: &CoreError,
    ctx: Arc<ServiceIpContext>,
) -> Action {
    let delay = ctx.backoff.next_delay(&ObjectRef::from_obj(&*service).to_string());
    warn!(
        namespace = %service.namespace().unwrap_or_default(),
        name = %service.name_any(),
        error = %error,
        retry_secs = delay.as_secs(),
        "Service reconcile failed, requeueing"
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{service_import, TestCluster};
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use mcs_core::ObjectStore;

    fn context(cluster: &TestCluster) -> Arc<ServiceIpContext> {
        Arc::new(ServiceIpContext {
            local: cluster.local.clone(),
            backoff: ErrorBackoff::default(),
        })
    }

    fn owned_service(import: &ServiceImport, cluster_ip: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("derived-cart".to_string()),
                namespace: Some("shop".to_string()),
                owner_references: import.controller_owner_ref(&()).map(|owner| vec![owner]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: cluster_ip.map(str::to_string),
                ..Default::default()
            }),
            status: None,
        }
    }

    async fn stored_ips(cluster: &TestCluster) -> Vec<String> {
        cluster
            .imports
            .get("shop", "cart")
            .await
            .unwrap()
            .unwrap()
            .spec
            .ips
    }

    #[tokio::test]
    async fn first_cluster_ip_is_recorded() {
        let cluster = TestCluster::new();
        let import = cluster.imports.seed(service_import("shop", "cart", &[])).await;
        let service = owned_service(&import, Some("10.96.0.10"));

        reconcile(Arc::new(service), context(&cluster)).await.unwrap();

        assert_eq!(stored_ips(&cluster).await, vec!["10.96.0.10".to_string()]);
    }

    #[tokio::test]
    async fn existing_ips_win() {
        let cluster = TestCluster::new();
        let import = cluster
            .imports
            .seed(service_import("shop", "cart", &["10.96.0.1"]))
            .await;
        let service = owned_service(&import, Some("10.96.0.10"));

        reconcile(Arc::new(service), context(&cluster)).await.unwrap();

        assert_eq!(stored_ips(&cluster).await, vec!["10.96.0.1".to_string()]);
        assert_eq!(cluster.imports.writes(), 0);
    }

    #[tokio::test]
    async fn headless_and_pending_services_are_skipped() {
        let cluster = TestCluster::new();
        let import = cluster.imports.seed(service_import("shop", "cart", &[])).await;

        for ip in [None, Some(""), Some("None")] {
            let service = owned_service(&import, ip);
            reconcile(Arc::new(service), context(&cluster)).await.unwrap();
        }

        assert!(stored_ips(&cluster).await.is_empty());
        assert_eq!(cluster.imports.writes(), 0);
    }

    #[tokio::test]
    async fn services_without_import_owner_are_ignored() {
        let cluster = TestCluster::new();
        let import = cluster.imports.seed(service_import("shop", "cart", &[])).await;
        let mut service = owned_service(&import, Some("10.96.0.10"));
        service.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "cart".to_string(),
            uid: "d-1".to_string(),
            ..Default::default()
        }]);

        reconcile(Arc::new(service), context(&cluster)).await.unwrap();

        assert!(stored_ips(&cluster).await.is_empty());
    }

    #[tokio::test]
    async fn missing_import_is_a_no_op() {
        let cluster = TestCluster::new();
        let mut import = service_import("shop", "cart", &[]);
        import.metadata.uid = Some("gone".to_string());
        let service = owned_service(&import, Some("10.96.0.10"));

        let action = reconcile(Arc::new(service), context(&cluster)).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(cluster.imports.writes(), 0);
    }
}
