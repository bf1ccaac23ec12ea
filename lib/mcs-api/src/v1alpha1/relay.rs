use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Relay carries one object from a member cluster into the parent control plane.
///
/// Relays live in the per-agent namespace of the originating cluster. The
/// template is the serialized source object and is never interpreted by the
/// relay layer; provenance is carried in labels (see [`crate::labels`]).
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "multicluster.datum.net",
    version = "v1alpha1",
    kind = "Relay",
    plural = "relays",
    namespaced,
    derive = "Default",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".metadata.labels.multicluster\\.datum\\.net/origin-kind"}"#,
    printcolumn = r#"{"name":"Agent","type":"string","jsonPath":".metadata.labels.multicluster\\.datum\\.net/origin-agent"}"#,
)]
pub struct RelaySpec {
    /// Serialized source object (JSON)
    pub template: String,
}
