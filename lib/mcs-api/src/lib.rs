//! Datum multi-cluster service API types and CRDs
//!
//! This library defines the custom resources exchanged between member clusters
//! and the parent control plane:
//! - ServiceExport: marks a local Service whose endpoints are published to the fleet
//! - ServiceImport: consolidates ports and virtual IPs of a fleet-wide service
//! - Relay: opaque carrier object stored in the parent, one namespace per agent

pub mod labels;
pub mod v1alpha1;

pub use v1alpha1::{
    ImportIngress, ImportLoadBalancerStatus, ImportPort, Relay, RelaySpec, ServiceExport,
    ServiceExportSpec, ServiceImport, ServiceImportSpec, ServiceImportStatus,
};
