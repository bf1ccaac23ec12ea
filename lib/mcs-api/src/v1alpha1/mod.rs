//! API version v1alpha1 for Datum multi-cluster CRDs

pub mod relay;
pub mod service_export;
pub mod service_import;

pub use relay::{Relay, RelaySpec};
pub use service_export::{ServiceExport, ServiceExportSpec};
pub use service_import::{
    ImportIngress, ImportLoadBalancerStatus, ImportPort, ServiceImport, ServiceImportSpec,
    ServiceImportStatus,
};

/// API group for Datum multi-cluster resources
pub const API_GROUP: &str = "multicluster.datum.net";
/// API version for Datum multi-cluster resources
pub const API_VERSION: &str = "v1alpha1";
