//! Typed store bundles injected into the reconcilers
//!
//! Each reconciler receives the local bundle and, where it touches relays, the
//! parent bundle. Neither is ever reached through global state.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Client;
use mcs_api::labels::CONTROLLER_NAME;
use mcs_api::{Relay, ServiceExport, ServiceImport};
use mcs_core::{AuditSink, KubeAuditSink, KubeStore, ObjectStore};

/// Stores of the member cluster this controller runs in
#[derive(Clone)]
pub struct LocalCluster {
    pub exports: Arc<dyn ObjectStore<ServiceExport>>,
    pub imports: Arc<dyn ObjectStore<ServiceImport>>,
    pub services: Arc<dyn ObjectStore<Service>>,
    pub endpoint_slices: Arc<dyn ObjectStore<EndpointSlice>>,
    /// Audit trail filed against local intent objects
    pub audit: Arc<dyn AuditSink>,
}

impl LocalCluster {
    pub fn from_client(client: Client) -> Self {
        Self {
            exports: Arc::new(KubeStore::new(client.clone(), CONTROLLER_NAME)),
            imports: Arc::new(KubeStore::new(client.clone(), CONTROLLER_NAME)),
            services: Arc::new(KubeStore::new(client.clone(), CONTROLLER_NAME)),
            endpoint_slices: Arc::new(KubeStore::new(client.clone(), CONTROLLER_NAME)),
            audit: Arc::new(KubeAuditSink::new(client, CONTROLLER_NAME)),
        }
    }
}

/// Stores of the parent control plane
#[derive(Clone)]
pub struct ParentCluster {
    pub relays: Arc<dyn ObjectStore<Relay>>,
}

impl ParentCluster {
    pub fn from_client(client: Client) -> Self {
        Self {
            relays: Arc::new(KubeStore::new(client, CONTROLLER_NAME)),
        }
    }
}
