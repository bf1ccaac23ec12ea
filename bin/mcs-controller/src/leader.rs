//! Leader election on a coordination.k8s.io/v1 Lease
//!
//! Only the holder of the lease runs the controllers. Every write to the lease
//! carries the resourceVersion that was read, so two candidates racing for an
//! expired lease cannot both win: the loser's replace fails with a conflict.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use mcs_core::{CoreError, ObjectStore, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

pub struct LeaderElector {
    leases: Arc<dyn ObjectStore<Lease>>,
    namespace: String,
    lease_name: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(
        leases: Arc<dyn ObjectStore<Lease>>,
        namespace: &str,
        lease_name: &str,
        identity: &str,
    ) -> Self {
        Self {
            leases,
            namespace: namespace.to_string(),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Wait until the lease is ours, then keep renewing it in the background
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, lease = %self.lease_name, "Waiting for leadership...");

        loop {
            match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    break;
                }
                Ok(false) => debug!(identity = %self.identity, "Lease held by another candidate"),
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        "Failed to acquire lease, retrying"
                    )
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }

        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(&self);
        let renewal_task = tokio::spawn(async move { elector.renewal_loop(lost_tx).await });
        LeaderGuard {
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to renew lease");
                    break;
                }
            }
        }
        warn!(identity = %self.identity, "Leadership lost");
        let _ = lost_tx.send(());
    }

    /// One election round at `now`; true while this candidate holds the lease
    async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(lease) = self.leases.get(&self.namespace, &self.lease_name).await? else {
            return self.create(now).await;
        };

        let spec = lease.spec.clone().unwrap_or_default();
        let held_by_us = spec.holder_identity.as_deref() == Some(self.identity.as_str());
        if !held_by_us && !lease_expired(&spec, now) {
            return Ok(false);
        }

        let mut next = lease;
        let next_spec = next.spec.get_or_insert_with(LeaseSpec::default);
        next_spec.renew_time = Some(MicroTime(now));
        if !held_by_us {
            next_spec.holder_identity = Some(self.identity.clone());
            next_spec.acquire_time = Some(MicroTime(now));
            next_spec.lease_duration_seconds = Some(LEASE_DURATION.as_secs() as i32);
            next_spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }

        match self.leases.replace(&next).await {
            Ok(_) => {
                if !held_by_us {
                    info!(identity = %self.identity, "Took over expired lease");
                }
                Ok(true)
            }
            Err(CoreError::Conflict(_)) => {
                debug!(identity = %self.identity, "Lease changed underneath us");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn create(&self, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match self.leases.create(&lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created lease");
                Ok(true)
            }
            Err(CoreError::AlreadyExists(_)) | Err(CoreError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// True when the lease was never renewed or its duration has elapsed
pub fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    match (spec.renew_time.as_ref(), spec.lease_duration_seconds) {
        (Some(renewed), Some(seconds)) => {
            now > renewed.0 + chrono::Duration::seconds(seconds as i64)
        }
        _ => true,
    }
}

/// Held while this process leads; dropping it stops renewal
pub struct LeaderGuard {
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Resolves once the lease could not be renewed
    pub async fn lost(&mut self) {
        match self.lost_rx.take() {
            Some(rx) => {
                let _ = rx.await;
            }
            None => futures::future::pending::<()>().await,
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcs_core::MemoryStore;

    fn candidate(store: &MemoryStore<Lease>, identity: &str) -> LeaderElector {
        LeaderElector::new(Arc::new(store.clone()), "mcs-system", "mcs-controller-leader", identity)
    }

    async fn holder(store: &MemoryStore<Lease>) -> Option<String> {
        store
            .get("mcs-system", "mcs-controller-leader")
            .await
            .unwrap()
            .and_then(|lease| lease.spec)
            .and_then(|spec| spec.holder_identity)
    }

    #[tokio::test]
    async fn first_candidate_creates_the_lease() {
        let store = MemoryStore::new();
        let a = candidate(&store, "pod-a");

        assert!(a.try_acquire_or_renew(Utc::now()).await.unwrap());
        assert_eq!(holder(&store).await.as_deref(), Some("pod-a"));
    }

    #[tokio::test]
    async fn fresh_lease_is_not_taken_over() {
        let store = MemoryStore::new();
        let a = candidate(&store, "pod-a");
        let b = candidate(&store, "pod-b");
        let now = Utc::now();

        assert!(a.try_acquire_or_renew(now).await.unwrap());
        assert!(!b.try_acquire_or_renew(now + chrono::Duration::seconds(5)).await.unwrap());
        assert!(a.try_acquire_or_renew(now + chrono::Duration::seconds(5)).await.unwrap());
        assert_eq!(holder(&store).await.as_deref(), Some("pod-a"));
    }

    #[tokio::test]
    async fn expired_lease_changes_hands() {
        let store = MemoryStore::new();
        let a = candidate(&store, "pod-a");
        let b = candidate(&store, "pod-b");
        let now = Utc::now();

        assert!(a.try_acquire_or_renew(now).await.unwrap());
        assert!(b.try_acquire_or_renew(now + chrono::Duration::seconds(16)).await.unwrap());

        let lease = store
            .get("mcs-system", "mcs-controller-leader")
            .await
            .unwrap()
            .unwrap();
        let spec = lease.spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("pod-b"));
        assert_eq!(spec.lease_transitions, Some(1));
    }

    #[test]
    fn lease_without_renew_time_is_expired() {
        let now = Utc::now();
        assert!(lease_expired(&LeaseSpec::default(), now));

        let spec = LeaseSpec {
            renew_time: Some(MicroTime(now)),
            lease_duration_seconds: Some(15),
            ..Default::default()
        };
        assert!(!lease_expired(&spec, now + chrono::Duration::seconds(15)));
        assert!(lease_expired(&spec, now + chrono::Duration::seconds(16)));
    }
}
