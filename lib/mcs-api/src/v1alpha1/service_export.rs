use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ServiceExport marks the Service of the same namespace/name as published to
/// the fleet. Its EndpointSlices are relayed into the parent control plane for
/// as long as the export exists.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "multicluster.datum.net",
    version = "v1alpha1",
    kind = "ServiceExport",
    plural = "serviceexports",
    shortname = "svcex",
    namespaced,
    derive = "Default",
    derive = "PartialEq",
)]
pub struct ServiceExportSpec {}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn crd_is_namespaced_in_multicluster_group() {
        let crd = ServiceExport::crd();
        assert_eq!(crd.spec.group, "multicluster.datum.net");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "ServiceExport");
    }
}
