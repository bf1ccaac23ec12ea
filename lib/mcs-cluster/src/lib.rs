//! Connections to the member cluster and the parent control plane
pub mod client;
pub mod cluster;

pub use client::{ClusterClient, ClusterRole};
pub use cluster::{LocalCluster, ParentCluster};
