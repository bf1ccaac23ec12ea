//! The narrow object-store contract the reconcilers consume
//!
//! Reconcilers never hold a `kube::Client` directly. They receive one
//! `ObjectStore` per resource type, which keeps the platform surface to
//! get/list/create/replace/patch-status/delete/delete-by-label and lets tests
//! substitute [`crate::MemoryStore`].

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::naming::{selector_string, Labels};
use crate::{CoreError, Result};

/// Typed access to one namespaced resource kind in one cluster
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Fetch an object, `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects matching every label in `selector`; all namespaces when `namespace` is `None`
    async fn list(&self, namespace: Option<&str>, selector: &Labels) -> Result<Vec<K>>;

    /// Create an object in its metadata namespace
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace an object; a stale resourceVersion fails with [`CoreError::Conflict`]
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Merge-patch the status subresource
    async fn patch_status(&self, namespace: &str, name: &str, status: serde_json::Value)
        -> Result<K>;

    /// Delete an object, returning false when it was already gone
    async fn delete(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Delete every object in `namespace` matching `selector`
    async fn delete_all(&self, namespace: &str, selector: &Labels) -> Result<()>;
}

/// `ObjectStore` backed by the Kubernetes API
pub struct KubeStore<K> {
    client: Client,
    field_manager: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

fn subject<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> String {
    format!("{} {}/{}", K::kind(&()), namespace, name)
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .namespace
        .clone()
        .ok_or(CoreError::MissingField("metadata.namespace"))
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn list(&self, namespace: Option<&str>, selector: &Labels) -> Result<Vec<K>> {
        let api: Api<K> = match namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        let params = ListParams::default().labels(&selector_string(selector));
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let namespace = namespace_of(obj)?;
        self.api(&namespace)
            .create(&self.post_params(), obj)
            .await
            .map_err(|e| CoreError::from_kube(e, &subject::<K>(&namespace, &obj.name_any())))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let namespace = namespace_of(obj)?;
        let name = obj.name_any();
        self.api(&namespace)
            .replace(&name, &self.post_params(), obj)
            .await
            .map_err(|e| CoreError::from_kube(e, &subject::<K>(&namespace, &name)))
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<K> {
        let patch = serde_json::json!({ "status": status });
        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| CoreError::from_kube(e, &subject::<K>(namespace, name)))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(kind = %K::kind(&()), %namespace, %name, "already deleted");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_all(&self, namespace: &str, selector: &Labels) -> Result<()> {
        let params = ListParams::default().labels(&selector_string(selector));
        match self
            .api(namespace)
            .delete_collection(&DeleteParams::default(), &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
