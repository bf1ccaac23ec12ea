//! In-memory object store for exercising reconcilers without an API server
//!
//! Mirrors the API-server behaviour the reconcilers depend on: resourceVersion
//! checks on replace, finalizer-gated deletion, status preserved across
//! replace, and owner-reference garbage collection on request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::naming::{labels_match, Labels};
use crate::store::ObjectStore;
use crate::{CoreError, Result};

type Key = (String, String);

/// MemoryStore keeps one resource kind keyed by namespace/name
pub struct MemoryStore<K> {
    objects: Arc<RwLock<BTreeMap<Key, K>>>,
    version: Arc<AtomicU64>,
    writes: Arc<AtomicUsize>,
}

impl<K> Clone for MemoryStore<K> {
    fn clone(&self) -> Self {
        Self {
            objects: self.objects.clone(),
            version: self.version.clone(),
            writes: self.writes.clone(),
        }
    }
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            version: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls that changed stored state
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Insert or overwrite an object as-is, without counting a write
    pub async fn seed(&self, mut obj: K) -> K {
        let key = key_of(&obj);
        self.stamp(&mut obj);
        self.objects.write().await.insert(key, obj.clone());
        obj
    }

    /// Every stored object, ordered by namespace/name
    pub async fn all(&self) -> Vec<K> {
        self.objects.read().await.values().cloned().collect()
    }

    /// Stored names in `namespace`, ordered
    pub async fn names(&self, namespace: &str) -> Vec<String> {
        self.objects
            .read()
            .await
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Remove every object whose owner references include `owner_uid`,
    /// standing in for the platform garbage collector
    pub async fn collect_garbage(&self, owner_uid: &str) -> usize {
        let mut objects = self.objects.write().await;
        let before = objects.len();
        objects.retain(|_, obj| {
            !obj.owner_references()
                .iter()
                .any(|owner| owner.uid == owner_uid)
        });
        let removed = before - objects.len();
        debug!(owner_uid, removed, "collected owned objects");
        removed
    }

    fn stamp(&self, obj: &mut K) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let meta = obj.meta_mut();
        meta.resource_version = Some(version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn key_of<K: Resource>(obj: &K) -> Key {
    (
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

fn subject(key: &Key) -> String {
    format!("{}/{}", key.0, key.1)
}

/// Carry `status` from `stored` onto `incoming`, as the API server does for
/// replace calls on resources with a status subresource
fn keep_status<K: Serialize + DeserializeOwned>(stored: &K, incoming: &K) -> Result<K> {
    let stored = serde_json::to_value(stored)?;
    let mut incoming = serde_json::to_value(incoming)?;
    if let Some(obj) = incoming.as_object_mut() {
        match stored.get("status") {
            Some(status) => {
                obj.insert("status".to_string(), status.clone());
            }
            None => {
                obj.remove("status");
            }
        }
    }
    Ok(serde_json::from_value(incoming)?)
}

/// RFC 7386 JSON merge patch
fn merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge(
                        target.entry(key.clone()).or_insert(serde_json::Value::Null),
                        value,
                    );
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let objects = self.objects.read().await;
        Ok(objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(&self, namespace: Option<&str>, selector: &Labels) -> Result<Vec<K>> {
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .filter(|((ns, _), _)| namespace.map(|want| want == ns).unwrap_or(true))
            .filter(|(_, obj)| labels_match(obj.meta().labels.as_ref(), selector))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        if obj.meta().namespace.is_none() {
            return Err(CoreError::MissingField("metadata.namespace"));
        }
        let key = key_of(obj);
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(CoreError::AlreadyExists(subject(&key)));
        }
        let mut created = obj.clone();
        created.meta_mut().uid = None;
        self.stamp(&mut created);
        objects.insert(key, created.clone());
        self.record_write();
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let key = key_of(obj);
        let mut objects = self.objects.write().await;
        let stored = objects
            .get(&key)
            .ok_or_else(|| CoreError::NotFound(subject(&key)))?;

        if let Some(version) = obj.meta().resource_version.as_ref() {
            if stored.meta().resource_version.as_ref() != Some(version) {
                return Err(CoreError::Conflict(subject(&key)));
            }
        }

        let mut replaced = keep_status(stored, obj)?;
        replaced.meta_mut().uid = stored.meta().uid.clone();
        replaced.meta_mut().deletion_timestamp = stored.meta().deletion_timestamp.clone();
        self.record_write();

        if replaced.meta().deletion_timestamp.is_some() && replaced.finalizers().is_empty() {
            objects.remove(&key);
            return Ok(replaced);
        }

        self.stamp(&mut replaced);
        objects.insert(key, replaced.clone());
        Ok(replaced)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<K> {
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.objects.write().await;
        let stored = objects
            .get(&key)
            .ok_or_else(|| CoreError::NotFound(subject(&key)))?;

        let mut value = serde_json::to_value(stored)?;
        merge(&mut value, &serde_json::json!({ "status": status }));
        let mut patched: K = serde_json::from_value(value)?;
        self.stamp(&mut patched);
        objects.insert(key, patched.clone());
        self.record_write();
        Ok(patched)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.objects.write().await;
        let Some(stored) = objects.get_mut(&key) else {
            return Ok(false);
        };

        if stored.finalizers().is_empty() {
            objects.remove(&key);
        } else if stored.meta().deletion_timestamp.is_none() {
            stored.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
        } else {
            return Ok(true);
        }
        self.record_write();
        Ok(true)
    }

    async fn delete_all(&self, namespace: &str, selector: &Labels) -> Result<()> {
        let mut objects = self.objects.write().await;
        let before = objects.len();
        objects.retain(|(ns, _), obj| {
            ns != namespace || !labels_match(obj.meta().labels.as_ref(), selector)
        });
        if objects.len() != before {
            self.record_write();
        }
        Ok(())
    }
}
