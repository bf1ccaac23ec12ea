//! Well-known label, annotation and finalizer keys
//!
//! Relay provenance is expressed entirely through labels so that relays can be
//! listed and bulk-deleted by selector without decoding their templates.

/// Group of the object carried by a relay
pub const ORIGIN_GROUP: &str = "multicluster.datum.net/origin-group";
/// Version of the object carried by a relay
pub const ORIGIN_VERSION: &str = "multicluster.datum.net/origin-version";
/// Kind of the object carried by a relay
pub const ORIGIN_KIND: &str = "multicluster.datum.net/origin-kind";
/// Name of the source object
pub const ORIGIN_NAME: &str = "multicluster.datum.net/origin-name";
/// Namespace of the source object
pub const ORIGIN_NAMESPACE: &str = "multicluster.datum.net/origin-namespace";
/// UID of the source object
pub const ORIGIN_UID: &str = "multicluster.datum.net/origin-uid";
/// Agent identifier of the originating cluster
pub const ORIGIN_AGENT: &str = "multicluster.datum.net/origin-agent";
/// Logical service the carried object belongs to
pub const SERVICE_NAME: &str = "multicluster.datum.net/service-name";
/// Marks objects materialized by this controller
pub const CREATED_BY: &str = "multicluster.datum.net/created-by";

/// Value of [`CREATED_BY`] and of the EndpointSlice managed-by label
pub const CONTROLLER_NAME: &str = "mcs-controller";

/// Kubernetes label tying an EndpointSlice to its Service
pub const K8S_SERVICE_NAME: &str = "kubernetes.io/service-name";
/// Kubernetes label naming the controller that manages an EndpointSlice
pub const K8S_MANAGED_BY: &str = "endpointslice.kubernetes.io/managed-by";

/// Finalizer held by a ServiceExport until its relays are removed
pub const EXPORT_FINALIZER: &str = "multicluster.datum.net/service-export-cleanup";
/// Finalizer held by a ServiceImport while it is active
pub const IMPORT_FINALIZER: &str = "multicluster.datum.net/service-import-cleanup";
