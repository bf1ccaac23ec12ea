use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ServiceImport describes a fleet-wide service as seen by consuming clusters.
///
/// The same namespace/name is replicated by convention in every member cluster.
/// `ips` collects the virtual IPs observed on publishing clusters and is written
/// once, by the first cluster that observes an assigned cluster IP.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "multicluster.datum.net",
    version = "v1alpha1",
    kind = "ServiceImport",
    plural = "serviceimports",
    shortname = "svcim",
    namespaced,
    derive = "Default",
    derive = "PartialEq",
    status = "ServiceImportStatus",
    printcolumn = r#"{"name":"IPs","type":"string","jsonPath":".spec.ips"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceImportSpec {
    /// Ports exposed by the imported service
    #[serde(default)]
    pub ports: Vec<ImportPort>,

    /// Virtual IPs observed on publishing clusters
    #[serde(default)]
    pub ips: Vec<String>,
}

/// A single port of an imported service
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportPort {
    /// Port name, required when more than one port is declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// TCP, UDP or SCTP (defaults to TCP)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Port number
    pub port: i32,

    /// Application protocol hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,
}

/// Status of a ServiceImport
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceImportStatus {
    /// Load-balancer view built from `spec.ips`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<ImportLoadBalancerStatus>,
}

/// Load-balancer status of a ServiceImport
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ImportLoadBalancerStatus {
    #[serde(default)]
    pub ingress: Vec<ImportIngress>,
}

/// One ingress point of an imported service
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ImportIngress {
    pub ip: String,
}

impl ImportLoadBalancerStatus {
    /// One ingress entry per observed IP, in spec order
    pub fn from_ips(ips: &[String]) -> Self {
        Self {
            ingress: ips.iter().map(|ip| ImportIngress { ip: ip.clone() }).collect(),
        }
    }
}
