//! ServiceImport controller: materializes relayed endpoints as local objects
//!
//! For every ServiceImport the controller keeps one derived ClusterIP Service
//! and one derived EndpointSlice per relayed remote slice, all owned by the
//! import so the garbage collector reclaims them once it is gone. The Service
//! load-balancer status and the import status both mirror `spec.ips`.
//!
//! Relays are decoded one at a time. A relay that fails to decode, or a
//! derived slice that fails to sync, is logged and audited without blocking
//! the rest.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, ObjectReference, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::controller::{Action, Config, Error as ControllerError};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use kube_runtime::Controller;
use mcs_api::labels::{
    CONTROLLER_NAME, CREATED_BY, IMPORT_FINALIZER, K8S_MANAGED_BY, ORIGIN_AGENT, ORIGIN_NAME,
    ORIGIN_NAMESPACE, ORIGIN_UID, SERVICE_NAME,
};
use mcs_api::{ImportLoadBalancerStatus, Relay, ServiceImport};
use mcs_cluster::{LocalCluster, ParentCluster};
use mcs_core::diff::stale_names;
use mcs_core::envelope::{origin_agent, unwrap};
use mcs_core::events::{actions, reasons};
use mcs_core::finalizer::{add_finalizer, has_finalizer, is_deleting, remove_finalizer};
use mcs_core::naming::{
    derived_name, derived_service_name, derived_slice_selector, import_relay_selector,
    is_dns_subdomain,
};
use mcs_core::{AuditRecord, CoreError, Result};
use tracing::{debug, info, instrument, warn};

use crate::backoff::ErrorBackoff;
use crate::metrics::{self, ReconcileMetrics};
use crate::REQUEUE_AFTER;

const CONTROLLER: &str = "import";

pub struct ImportContext {
    pub local: LocalCluster,
    pub parent: ParentCluster,
    pub backoff: ErrorBackoff,
}

impl ImportContext {
    async fn audit(&self, subject: &ObjectReference, record: AuditRecord) {
        self.local.audit.record(subject, record).await;
    }
}

pub struct ImportController {
    client: Client,
    parent_client: Client,
    ctx: Arc<ImportContext>,
    metrics: Arc<ReconcileMetrics>,
    workers: u16,
}

impl ImportController {
    pub fn new(
        client: Client,
        parent_client: Client,
        ctx: ImportContext,
        metrics: Arc<ReconcileMetrics>,
        workers: u16,
    ) -> Self {
        Self {
            client,
            parent_client,
            ctx: Arc::new(ctx),
            metrics,
            workers,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Starting ServiceImport reconciliation");

        let imports: Api<ServiceImport> = Api::all(self.client.clone());
        let services: Api<Service> = Api::all(self.client.clone());
        let slices: Api<EndpointSlice> = Api::all(self.client.clone());
        let relays: Api<Relay> = Api::all(self.parent_client.clone());

        let controller = Controller::new(imports, watcher::Config::default());
        let store = controller.store();

        let mut stream = controller
            .owns(services, watcher::Config::default())
            .owns(slices, watcher::Config::default())
            .watches(relays, watcher::Config::default(), move |relay| {
                import_for_relay(&relay).filter(|import| store.get(import).is_some())
            })
            .with_config(Config::default().concurrency(self.workers))
            .run(reconcile, error_policy, self.ctx.clone())
            .boxed();

        while let Some(item) = stream.next().await {
            match item {
                Ok((import, _)) => {
                    debug!(import = %import, "Reconciled ServiceImport");
                    self.ctx.backoff.reset(&import.to_string());
                    self.metrics.record(CONTROLLER, metrics::SUCCESS);
                }
                Err(e) => {
                    // a requeued object that has since been deleted
                    if let ControllerError::ObjectNotFound(gone) = &e {
                        self.ctx.backoff.reset(&gone.to_string());
                    }
                    warn!(error = %e, "ServiceImport reconciliation failed");
                    self.metrics.record(CONTROLLER, metrics::ERROR);
                }
            }
        }

        Ok(())
    }
}

/// The local ServiceImport a relay feeds, by its origin namespace and service labels
pub fn import_for_relay(relay: &Relay) -> Option<ObjectRef<ServiceImport>> {
    let namespace = relay.labels().get(ORIGIN_NAMESPACE)?;
    let service = relay.labels().get(SERVICE_NAME)?;
    Some(ObjectRef::new(service).within(namespace))
}

#[instrument(
    skip_all,
    fields(namespace = %import.namespace().unwrap_or_default(), name = %import.name_any())
)]
pub async fn reconcile(import: Arc<ServiceImport>, ctx: Arc<ImportContext>) -> Result<Action> {
    let namespace = import
        .namespace()
        .ok_or(CoreError::MissingField("metadata.namespace"))?;
    let name = import.name_any();
    let subject = import.object_ref(&());

    if is_deleting(&*import) {
        // derived objects go with the import through their owner references
        if has_finalizer(&*import, IMPORT_FINALIZER) {
            let mut released = (*import).clone();
            remove_finalizer(&mut released, IMPORT_FINALIZER);
            ctx.local.imports.replace(&released).await?;
            info!("Released ServiceImport");
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&*import, IMPORT_FINALIZER) {
        let mut held = (*import).clone();
        add_finalizer(&mut held, IMPORT_FINALIZER);
        ctx.local.imports.replace(&held).await?;
        debug!("Added finalizer");
    }

    let owner = import
        .controller_owner_ref(&())
        .ok_or(CoreError::MissingField("metadata.uid"))?;
    let service_name = derived_service_name(&name);
    let target = Target {
        namespace: &namespace,
        service_name: &service_name,
        owner: &owner,
        subject: &subject,
    };

    match sync_service(&ctx, &import, &target).await? {
        ServiceSync::Ready(service) => {
            sync_load_balancer(&ctx, &import, &service, &target).await?;
        }
        // nothing signals the squatter going away, so look again later
        ServiceSync::Conflict => return Ok(Action::requeue(REQUEUE_AFTER)),
        ServiceSync::NoPorts => {}
    }
    sync_slices(&ctx, &name, &target).await?;

    Ok(Action::requeue(REQUEUE_AFTER))
}

pub fn error_policy(
    import: Arc<ServiceImport>,
    error: &CoreError,
    ctx: Arc<ImportContext>,
) -> Action {
    let delay = ctx.backoff.next_delay(&ObjectRef::from_obj(&*import).to_string());
    warn!(
        namespace = %import.namespace().unwrap_or_default(),
        name = %import.name_any(),
        error = %error,
        retry_secs = delay.as_secs(),
        "ServiceImport reconcile failed, requeueing"
    );
    Action::requeue(delay)
}

/// Where derived objects of one import land
struct Target<'a> {
    namespace: &'a str,
    service_name: &'a str,
    owner: &'a OwnerReference,
    subject: &'a ObjectReference,
}

/// Outcome of the derived Service step
enum ServiceSync {
    Ready(Service),
    /// An unmanaged Service holds the derived name
    Conflict,
    /// The import lists no ports; a ClusterIP Service needs at least one
    NoPorts,
}

fn is_managed(service: &Service) -> bool {
    service.annotations().get(CREATED_BY).map(String::as_str) == Some(CONTROLLER_NAME)
}

/// Ports as the API server stores them once defaulted
fn service_ports(import: &ServiceImport) -> Vec<ServicePort> {
    import
        .spec
        .ports
        .iter()
        .map(|port| ServicePort {
            name: port.name.clone(),
            protocol: Some(port.protocol.clone().unwrap_or_else(|| "TCP".to_string())),
            port: port.port,
            target_port: Some(IntOrString::Int(port.port)),
            app_protocol: port.app_protocol.clone(),
            ..Default::default()
        })
        .collect()
}

/// Overlay the managed fields of the derived Service onto `service`,
/// leaving the allocated cluster IPs alone
fn apply_service(mut service: Service, import: &ServiceImport, target: &Target<'_>) -> Service {
    service.metadata.owner_references = Some(vec![target.owner.clone()]);
    service
        .annotations_mut()
        .insert(CREATED_BY.to_string(), CONTROLLER_NAME.to_string());
    let spec = service.spec.get_or_insert_with(ServiceSpec::default);
    spec.type_ = Some("ClusterIP".to_string());
    spec.ports = Some(service_ports(import));
    service
}

/// Create or update the derived Service
async fn sync_service(
    ctx: &ImportContext,
    import: &ServiceImport,
    target: &Target<'_>,
) -> Result<ServiceSync> {
    if import.spec.ports.is_empty() {
        warn!(service = %target.service_name, "ServiceImport has no ports");
        let note = format!(
            "service {}/{} not derived: import lists no ports",
            target.namespace, target.service_name
        );
        ctx.audit(
            target.subject,
            AuditRecord::warning(reasons::SERVICE_PORTS_MISSING, actions::CREATE, note),
        )
        .await;
        return Ok(ServiceSync::NoPorts);
    }

    let services = &ctx.local.services;
    match services.get(target.namespace, target.service_name).await? {
        Some(current) if !is_managed(&current) => {
            warn!(service = %target.service_name, "Service exists and is not managed here");
            let note = format!(
                "service {}/{} exists and is not managed by {}",
                target.namespace, target.service_name, CONTROLLER_NAME
            );
            ctx.audit(
                target.subject,
                AuditRecord::warning(reasons::SERVICE_CONFLICT, actions::UPDATE, note),
            )
            .await;
            Ok(ServiceSync::Conflict)
        }
        Some(current) => {
            let desired = apply_service(current.clone(), import, target);
            if desired == current {
                return Ok(ServiceSync::Ready(current));
            }
            let updated = services.replace(&desired).await?;
            info!(service = %target.service_name, "Updated derived Service");
            let note = format!("service {}/{}", target.namespace, target.service_name);
            ctx.audit(
                target.subject,
                AuditRecord::normal(reasons::SERVICE_UPDATED, actions::UPDATE, note),
            )
            .await;
            Ok(ServiceSync::Ready(updated))
        }
        None => {
            let fresh = Service {
                metadata: ObjectMeta {
                    name: Some(target.service_name.to_string()),
                    namespace: Some(target.namespace.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            let created = services
                .create(&apply_service(fresh, import, target))
                .await?;
            info!(service = %target.service_name, "Created derived Service");
            let note = format!("service {}/{}", target.namespace, target.service_name);
            ctx.audit(
                target.subject,
                AuditRecord::normal(reasons::SERVICE_CREATED, actions::CREATE, note),
            )
            .await;
            Ok(ServiceSync::Ready(created))
        }
    }
}

/// Mirror `spec.ips` into the Service and import load-balancer status
async fn sync_load_balancer(
    ctx: &ImportContext,
    import: &ServiceImport,
    service: &Service,
    target: &Target<'_>,
) -> Result<()> {
    let ingress: Vec<LoadBalancerIngress> = import
        .spec
        .ips
        .iter()
        .map(|ip| LoadBalancerIngress {
            ip: Some(ip.clone()),
            ..Default::default()
        })
        .collect();
    let current = service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.clone())
        .unwrap_or_default();
    if current != ingress {
        ctx.local
            .services
            .patch_status(
                target.namespace,
                target.service_name,
                serde_json::json!({ "loadBalancer": { "ingress": ingress } }),
            )
            .await?;
        debug!(ips = ?import.spec.ips, "Updated derived Service load balancer status");
    }

    let desired = ImportLoadBalancerStatus::from_ips(&import.spec.ips);
    let mirrored = import
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.clone())
        .unwrap_or_default();
    if mirrored != desired {
        ctx.local
            .imports
            .patch_status(
                target.namespace,
                &import.name_any(),
                serde_json::json!({ "loadBalancer": desired }),
            )
            .await?;
        debug!(ips = ?import.spec.ips, "Updated ServiceImport load balancer status");
    }
    Ok(())
}

/// Rebuild a relayed slice under its local identity
fn derive_slice(relay: &Relay, target: &Target<'_>) -> Result<EndpointSlice> {
    let agent = origin_agent(relay).ok_or_else(|| {
        CoreError::Template(format!("relay {} has no origin agent", relay.name_any()))
    })?;
    let mut remote: EndpointSlice = unwrap(relay)?;
    let remote_name = remote
        .metadata
        .name
        .clone()
        .ok_or(CoreError::MissingField("metadata.name"))?;
    if !is_dns_subdomain(&remote_name) {
        return Err(CoreError::Template(format!(
            "relay {} carries invalid object name {:?}",
            relay.name_any(),
            remote_name
        )));
    }

    let mut labels = derived_slice_selector(target.service_name);
    labels.insert(K8S_MANAGED_BY.to_string(), CONTROLLER_NAME.to_string());
    labels.insert(ORIGIN_AGENT.to_string(), agent.to_string());
    labels.insert(ORIGIN_NAME.to_string(), remote_name.clone());
    labels.insert(
        ORIGIN_NAMESPACE.to_string(),
        remote.metadata.namespace.clone().unwrap_or_default(),
    );
    labels.insert(
        ORIGIN_UID.to_string(),
        remote.metadata.uid.clone().unwrap_or_default(),
    );

    // topology of the remote cluster means nothing here
    for endpoint in remote.endpoints.iter_mut() {
        endpoint.target_ref = None;
        endpoint.node_name = None;
        endpoint.hints = None;
    }

    Ok(EndpointSlice {
        metadata: ObjectMeta {
            name: Some(derived_name(&remote_name, agent)),
            namespace: Some(target.namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![target.owner.clone()]),
            ..Default::default()
        },
        address_type: remote.address_type,
        endpoints: remote.endpoints,
        ports: remote.ports,
    })
}

fn same_slice(current: &EndpointSlice, desired: &EndpointSlice) -> bool {
    current.metadata.labels == desired.metadata.labels
        && current.metadata.owner_references == desired.metadata.owner_references
        && current.address_type == desired.address_type
        && current.endpoints == desired.endpoints
        && current.ports == desired.ports
}

/// Converge derived EndpointSlices on the relays of every agent
async fn sync_slices(ctx: &ImportContext, import_name: &str, target: &Target<'_>) -> Result<()> {
    let slices = &ctx.local.endpoint_slices;
    let mut existing: BTreeMap<String, EndpointSlice> = slices
        .list(Some(target.namespace), &derived_slice_selector(target.service_name))
        .await?
        .into_iter()
        .map(|slice| (slice.name_any(), slice))
        .collect();

    let selector = import_relay_selector(
        target.namespace,
        import_name,
        &EndpointSlice::kind(&()),
    );
    let relays = ctx.parent.relays.list(None, &selector).await?;

    let mut desired = Vec::with_capacity(relays.len());
    for relay in &relays {
        match derive_slice(relay, target) {
            Ok(slice) => desired.push(slice),
            Err(e) => {
                warn!(relay = %relay.name_any(), error = %e, "Skipping undecodable relay");
                let note = format!(
                    "relay {}/{}: {}",
                    relay.namespace().unwrap_or_default(),
                    relay.name_any(),
                    e
                );
                ctx.audit(
                    target.subject,
                    AuditRecord::warning(reasons::TEMPLATE_INVALID, actions::DECODE, note),
                )
                .await;
            }
        }
    }

    let desired_names: BTreeSet<String> = desired.iter().map(|slice| slice.name_any()).collect();
    let mut failures = 0;

    for stale in stale_names(existing.keys().cloned(), &desired_names) {
        existing.remove(&stale);
        match slices.delete(target.namespace, &stale).await {
            Ok(_) => {
                info!(slice = %stale, "Deleted stale derived EndpointSlice");
                let note = format!("endpointslice {}/{}", target.namespace, stale);
                ctx.audit(
                    target.subject,
                    AuditRecord::normal(reasons::SLICE_DELETED, actions::DELETE, note),
                )
                .await;
            }
            Err(e) => {
                failures += 1;
                slice_failed(ctx, target, &stale, actions::DELETE, &e).await;
            }
        }
    }

    for mut slice in desired {
        let name = slice.name_any();
        let (result, reason, action) = match existing.remove(&name) {
            None => (slices.create(&slice).await, reasons::SLICE_CREATED, actions::CREATE),
            Some(current) if same_slice(&current, &slice) => continue,
            Some(current) => {
                slice.metadata.resource_version = current.metadata.resource_version;
                (slices.replace(&slice).await, reasons::SLICE_UPDATED, actions::UPDATE)
            }
        };
        match result {
            Ok(_) => {
                debug!(slice = %name, action, "Synced derived EndpointSlice");
                let note = format!("endpointslice {}/{}", target.namespace, name);
                ctx.audit(target.subject, AuditRecord::normal(reason, action, note))
                    .await;
            }
            Err(e) => {
                failures += 1;
                slice_failed(ctx, target, &name, action, &e).await;
            }
        }
    }

    if failures > 0 {
        return Err(CoreError::Internal(format!(
            "{} derived EndpointSlices failed to sync",
            failures
        )));
    }
    Ok(())
}

async fn slice_failed(
    ctx: &ImportContext,
    target: &Target<'_>,
    name: &str,
    action: &'static str,
    error: &CoreError,
) {
    warn!(slice = %name, action, error = %error, "Failed to sync derived EndpointSlice");
    let note = format!("endpointslice {}/{}: {}", target.namespace, name, error);
    ctx.audit(
        target.subject,
        AuditRecord::warning(reasons::SLICE_SYNC_FAILED, action, note),
    )
    .await;
}
