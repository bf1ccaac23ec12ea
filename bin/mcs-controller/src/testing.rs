//! In-memory clusters and object fixtures for reconciler tests

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use mcs_api::labels::K8S_SERVICE_NAME;
use mcs_api::{ImportPort, Relay, ServiceExport, ServiceImport, ServiceImportSpec};
use mcs_cluster::{LocalCluster, ParentCluster};
use mcs_core::{MemoryAuditSink, MemoryStore};

/// A member cluster backed by memory stores
pub struct TestCluster {
    pub local: LocalCluster,
    pub exports: MemoryStore<ServiceExport>,
    pub imports: MemoryStore<ServiceImport>,
    pub services: MemoryStore<Service>,
    pub slices: MemoryStore<EndpointSlice>,
    pub audit: Arc<MemoryAuditSink>,
}

impl TestCluster {
    pub fn new() -> Self {
        let exports = MemoryStore::new();
        let imports = MemoryStore::new();
        let services = MemoryStore::new();
        let slices = MemoryStore::new();
        let audit = Arc::new(MemoryAuditSink::new());
        let local = LocalCluster {
            exports: Arc::new(exports.clone()),
            imports: Arc::new(imports.clone()),
            services: Arc::new(services.clone()),
            endpoint_slices: Arc::new(slices.clone()),
            audit: audit.clone(),
        };
        Self {
            local,
            exports,
            imports,
            services,
            slices,
            audit,
        }
    }

    /// Writes across every local store
    pub fn writes(&self) -> usize {
        self.exports.writes()
            + self.imports.writes()
            + self.services.writes()
            + self.slices.writes()
    }
}

/// The parent control plane backed by a memory store
pub struct TestParent {
    pub parent: ParentCluster,
    pub relays: MemoryStore<Relay>,
}

impl TestParent {
    pub fn new() -> Self {
        let relays = MemoryStore::new();
        Self {
            parent: ParentCluster {
                relays: Arc::new(relays.clone()),
            },
            relays,
        }
    }
}

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

pub fn service_export(namespace: &str, name: &str) -> ServiceExport {
    ServiceExport {
        metadata: meta(namespace, name),
        spec: Default::default(),
    }
}

pub fn service_import(namespace: &str, name: &str, ips: &[&str]) -> ServiceImport {
    ServiceImport {
        metadata: meta(namespace, name),
        spec: ServiceImportSpec {
            ports: vec![ImportPort {
                name: Some("http".to_string()),
                protocol: Some("TCP".to_string()),
                port: 80,
                app_protocol: None,
            }],
            ips: ips.iter().map(|ip| ip.to_string()).collect(),
        },
        status: None,
    }
}

/// EndpointSlice of `service` with one ready endpoint per address
pub fn endpoint_slice(
    namespace: &str,
    name: &str,
    service: &str,
    addresses: &[&str],
) -> EndpointSlice {
    let mut metadata = meta(namespace, name);
    metadata.labels = Some(BTreeMap::from([(
        K8S_SERVICE_NAME.to_string(),
        service.to_string(),
    )]));
    EndpointSlice {
        metadata,
        address_type: "IPv4".to_string(),
        endpoints: addresses
            .iter()
            .map(|address| Endpoint {
                addresses: vec![address.to_string()],
                ..Default::default()
            })
            .collect(),
        ports: Some(vec![EndpointPort {
            name: Some("http".to_string()),
            port: Some(8080),
            protocol: Some("TCP".to_string()),
            app_protocol: None,
        }]),
    }
}
