//! Kubernetes clients for the local cluster and the parent control plane

use std::fmt;
use std::path::Path;

use anyhow::Context;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::info;

/// Which side of the relay a client talks to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterRole {
    /// The member cluster this controller runs in
    Local,
    /// The shared parent control plane holding relays
    Parent,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterRole::Local => write!(f, "local"),
            ClusterRole::Parent => write!(f, "parent"),
        }
    }
}

/// ClusterClient wraps the Kubernetes client of one cluster
pub struct ClusterClient {
    client: Client,
}

impl ClusterClient {
    /// Connect using `kubeconfig`, or the in-cluster / default configuration when absent
    pub async fn connect(role: ClusterRole, kubeconfig: Option<&Path>) -> anyhow::Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("reading {} kubeconfig {}", role, path.display()))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .with_context(|| format!("loading {} kubeconfig {}", role, path.display()))?
            }
            None => Config::infer()
                .await
                .with_context(|| format!("inferring {} cluster configuration", role))?,
        };

        info!(%role, cluster_url = %config.cluster_url, "connecting to cluster");
        let client = Client::try_from(config)
            .with_context(|| format!("building {} cluster client", role))?;
        Ok(Self { client })
    }

    /// Get a clone of the Kubernetes client
    pub fn clone_client(&self) -> Client {
        self.client.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_kubeconfig_names_the_cluster_role() {
        let err = ClusterClient::connect(
            ClusterRole::Parent,
            Some(Path::new("/nonexistent/parent.kubeconfig")),
        )
        .await
        .err()
        .expect("connect should fail");

        assert!(format!("{:#}", err).contains("parent kubeconfig"));
    }

    #[test]
    fn roles_display_lowercase() {
        assert_eq!(ClusterRole::Local.to_string(), "local");
        assert_eq!(ClusterRole::Parent.to_string(), "parent");
    }
}
