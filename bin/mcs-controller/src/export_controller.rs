//! ServiceExport controller: publishes local EndpointSlices as relays in the parent

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::controller::{Action, Config, Error as ControllerError};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use kube_runtime::Controller;
use mcs_api::labels::{EXPORT_FINALIZER, K8S_SERVICE_NAME};
use mcs_api::{Relay, ServiceExport};
use mcs_cluster::{LocalCluster, ParentCluster};
use mcs_core::diff::stale_names;
use mcs_core::envelope::wrap;
use mcs_core::events::{actions, reasons};
use mcs_core::finalizer::{add_finalizer, has_finalizer, is_deleting, remove_finalizer};
use mcs_core::naming::{is_derived, relay_namespace, relay_selector};
use mcs_core::{AuditRecord, CoreError, Labels, Result};
use tracing::{debug, info, instrument, warn};

use crate::backoff::ErrorBackoff;
use crate::metrics::{self, ReconcileMetrics};
use crate::REQUEUE_AFTER;

const CONTROLLER: &str = "export";

/// State shared by every export reconcile
pub struct ExportContext {
    pub agent_id: String,
    pub local: LocalCluster,
    pub parent: ParentCluster,
    pub backoff: ErrorBackoff,
}

impl ExportContext {
    async fn audit(&self, subject: &ObjectReference, record: AuditRecord) {
        self.local.audit.record(subject, record).await;
    }
}

pub struct ExportController {
    client: Client,
    ctx: Arc<ExportContext>,
    metrics: Arc<ReconcileMetrics>,
    workers: u16,
}

impl ExportController {
    pub fn new(
        client: Client,
        ctx: ExportContext,
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
        info!(agent = %self.ctx.agent_id, "Starting ServiceExport reconciliation");

        let exports: Api<ServiceExport> = Api::all(self.client.clone());
        let slices: Api<EndpointSlice> = Api::all(self.client.clone());

        let controller = Controller::new(exports, watcher::Config::default());
        let store = controller.store();

        let mut stream = controller
            .watches(slices, watcher::Config::default(), move |slice| {
                export_for_slice(&slice).filter(|export| store.get(export).is_some())
            })
            .with_config(Config::default().concurrency(self.workers))
            .run(reconcile, error_policy, self.ctx.clone())
            .boxed();

        while let Some(item) = stream.next().await {
            match item {
                Ok((export, _)) => {
                    debug!(export = %export, "Reconciled ServiceExport");
                    self.ctx.backoff.reset(&export.to_string());
                    self.metrics.record(CONTROLLER, metrics::SUCCESS);
                }
                Err(e) => {
                    // a requeued object that has since been deleted
                    if let ControllerError::ObjectNotFound(gone) = &e {
                        self.ctx.backoff.reset(&gone.to_string());
                    }
                    warn!(error = %e, "ServiceExport reconciliation failed");
                    self.metrics.record(CONTROLLER, metrics::ERROR);
                }
            }
        }

        Ok(())
    }
}

/// The ServiceExport an EndpointSlice belongs to, if it names a Service
///
/// Slices this controller derived from relays are never exported back.
pub fn export_for_slice(slice: &EndpointSlice) -> Option<ObjectRef<ServiceExport>> {
    if is_derived(slice.labels()) {
        return None;
    }
    let service = slice.labels().get(K8S_SERVICE_NAME)?;
    let namespace = slice.namespace()?;
    Some(ObjectRef::new(service).within(&namespace))
}

#[instrument(
    skip_all,
    fields(namespace = %export.namespace().unwrap_or_default(), name = %export.name_any())
)]
pub async fn reconcile(export: Arc<ServiceExport>, ctx: Arc<ExportContext>) -> Result<Action> {
    let namespace = export
        .namespace()
        .ok_or(CoreError::MissingField("metadata.namespace"))?;
    let name = export.name_any();
    let subject = export.object_ref(&());
    let relays = RelaySet {
        namespace: relay_namespace(&ctx.agent_id),
        selector: relay_selector(&ctx.agent_id, &name, &namespace, &EndpointSlice::kind(&())),
    };

    if is_deleting(&*export) {
        if has_finalizer(&*export, EXPORT_FINALIZER) {
            withdraw(&ctx, &relays, &subject).await?;
            let mut released = (*export).clone();
            remove_finalizer(&mut released, EXPORT_FINALIZER);
            ctx.local.exports.replace(&released).await?;
            info!("Withdrew relays and released ServiceExport");
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(&*export, EXPORT_FINALIZER) {
        let mut held = (*export).clone();
        add_finalizer(&mut held, EXPORT_FINALIZER);
        ctx.local.exports.replace(&held).await?;
        debug!("Added finalizer");
    }

    let service_selector = Labels::from([(K8S_SERVICE_NAME.to_string(), name.clone())]);
    let slices: Vec<EndpointSlice> = ctx
        .local
        .endpoint_slices
        .list(Some(&namespace), &service_selector)
        .await?
        .into_iter()
        .filter(|slice| !is_derived(slice.labels()))
        .collect();

    if slices.is_empty() {
        debug!("No local EndpointSlices");
        withdraw(&ctx, &relays, &subject).await?;
        return Ok(Action::requeue(REQUEUE_AFTER));
    }

    let desired = slices
        .iter()
        .map(|slice| wrap(slice, &ctx.agent_id, &name))
        .collect::<Result<Vec<_>>>()?;
    let desired_names: BTreeSet<String> = desired.iter().map(|relay| relay.name_any()).collect();

    let mut existing: BTreeMap<String, Relay> = ctx
        .parent
        .relays
        .list(Some(&relays.namespace), &relays.selector)
        .await?
        .into_iter()
        .map(|relay| (relay.name_any(), relay))
        .collect();

    for stale in stale_names(existing.keys().cloned(), &desired_names) {
        existing.remove(&stale);
        delete_relay(&ctx, &relays.namespace, &stale, &subject).await?;
    }

    for relay in desired {
        let current = existing.remove(&relay.name_any());
        upsert_relay(&ctx, current, relay, &subject).await?;
    }

    Ok(Action::requeue(REQUEUE_AFTER))
}

pub fn error_policy(
    export: Arc<ServiceExport>,
    error: &CoreError,
    ctx: Arc<ExportContext>,
) -> Action {
    let delay = ctx.backoff.next_delay(&ObjectRef::from_obj(&*export).to_string());
    warn!(
        namespace = %export.namespace().unwrap_or_default(),
        name = %export.name_any(),
        error = %error,
        retry_secs = delay.as_secs(),
        "ServiceExport reconcile failed, requeueing"
    );
    Action::requeue(delay)
}

/// Relays one agent publishes for one export
struct RelaySet {
    namespace: String,
    selector: Labels,
}

/// Remove every relay of the export; a no-op when none exist
async fn withdraw(ctx: &ExportContext, relays: &RelaySet, subject: &ObjectReference) -> Result<()> {
    let existing = ctx
        .parent
        .relays
        .list(Some(&relays.namespace), &relays.selector)
        .await?;
    if existing.is_empty() {
        return Ok(());
    }

    match ctx.parent.relays.delete_all(&relays.namespace, &relays.selector).await {
        Ok(()) => {
            info!(count = existing.len(), "Withdrew relays");
            let note = format!("withdrew {} relays from {}", existing.len(), relays.namespace);
            let record = AuditRecord::normal(reasons::RELAYS_WITHDRAWN, actions::DELETE, note);
            ctx.audit(subject, record).await;
            Ok(())
        }
        Err(e) => {
            let note = format!("withdrawing relays from {}: {}", relays.namespace, e);
            let record = AuditRecord::warning(reasons::RELAY_SYNC_FAILED, actions::DELETE, note);
            ctx.audit(subject, record).await;
            Err(e)
        }
    }
}

async fn delete_relay(
    ctx: &ExportContext,
    namespace: &str,
    name: &str,
    subject: &ObjectReference,
) -> Result<()> {
    match ctx.parent.relays.delete(namespace, name).await {
        Ok(_) => {
            info!(relay = %name, "Deleted stale relay");
            let note = format!("relay {}/{}", namespace, name);
            ctx.audit(subject, AuditRecord::normal(reasons::RELAY_DELETED, actions::DELETE, note))
                .await;
            Ok(())
        }
        Err(e) => {
            let note = format!("relay {}/{}: {}", namespace, name, e);
            let record = AuditRecord::warning(reasons::RELAY_SYNC_FAILED, actions::DELETE, note);
            ctx.audit(subject, record).await;
            Err(e)
        }
    }
}

/// Create `desired`, or replace `current` when its labels or template differ
async fn upsert_relay(
    ctx: &ExportContext,
    current: Option<Relay>,
    mut desired: Relay,
    subject: &ObjectReference,
) -> Result<()> {
    let name = desired.name_any();
    let namespace = desired.namespace().unwrap_or_default();

    let (result, reason, action) = match current {
        None => (
            ctx.parent.relays.create(&desired).await,
            reasons::RELAY_CREATED,
            actions::CREATE,
        ),
        Some(current) if current.labels() == desired.labels() && current.spec == desired.spec => {
            return Ok(());
        }
        Some(current) => {
            desired.metadata.resource_version = current.metadata.resource_version;
            (
                ctx.parent.relays.replace(&desired).await,
                reasons::RELAY_UPDATED,
                actions::UPDATE,
            )
        }
    };

    match result {
        Ok(_) => {
            debug!(relay = %name, action, "Synced relay");
            let note = format!("relay {}/{}", namespace, name);
            ctx.audit(subject, AuditRecord::normal(reason, action, note)).await;
            Ok(())
        }
        Err(e) => {
            let note = format!("relay {}/{}: {}", namespace, name, e);
            ctx.audit(subject, AuditRecord::warning(reasons::RELAY_SYNC_FAILED, action, note))
                .await;
            Err(e)
        }
    }
}
