//! Wrapping typed objects into relays and decoding them back
//!
//! The relay layer never assumes what a template contains. Decoding is lazy and
//! per item: callers unwrap one relay at a time and decide what a failure means.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use mcs_api::labels;
use mcs_api::{Relay, RelaySpec};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::naming::{relay_name, relay_namespace, Labels};
use crate::{CoreError, Result};

/// Build the relay carrying `obj` for `agent_id`, tagged with the service it belongs to
pub fn wrap<K>(obj: &K, agent_id: &str, service_name: &str) -> Result<Relay>
where
    K: Resource<DynamicType = ()> + Serialize + Clone,
{
    let meta = obj.meta();
    let name = meta.name.clone().ok_or(CoreError::MissingField("metadata.name"))?;
    let namespace = meta.namespace.clone().unwrap_or_default();
    let kind = K::kind(&()).to_string();

    let labels = Labels::from([
        (labels::ORIGIN_GROUP.to_string(), K::group(&()).to_string()),
        (labels::ORIGIN_VERSION.to_string(), K::version(&()).to_string()),
        (labels::ORIGIN_KIND.to_string(), kind.clone()),
        (labels::ORIGIN_NAME.to_string(), name.clone()),
        (labels::ORIGIN_NAMESPACE.to_string(), namespace.clone()),
        (labels::ORIGIN_UID.to_string(), meta.uid.clone().unwrap_or_default()),
        (labels::ORIGIN_AGENT.to_string(), agent_id.to_string()),
        (labels::SERVICE_NAME.to_string(), service_name.to_string()),
    ]);

    let mut payload = obj.clone();
    strip_server_fields(payload.meta_mut());

    Ok(Relay {
        metadata: ObjectMeta {
            name: Some(relay_name(&kind, &namespace, &name)),
            namespace: Some(relay_namespace(agent_id)),
            labels: Some(labels),
            ..Default::default()
        },
        spec: RelaySpec {
            template: serde_json::to_string(&payload)?,
        },
    })
}

/// Decode the object carried by `relay`
///
/// Fails when the relay's origin kind is not `K` or the template does not parse.
pub fn unwrap<K>(relay: &Relay) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let expected = K::kind(&());
    match relay.labels().get(labels::ORIGIN_KIND) {
        Some(kind) if kind.as_str() == &*expected => {}
        other => {
            return Err(CoreError::Template(format!(
                "relay {} carries kind {:?}, expected {}",
                relay.name_any(),
                other,
                expected
            )))
        }
    }

    serde_json::from_str(&relay.spec.template)
        .map_err(|e| CoreError::Template(format!("relay {}: {}", relay.name_any(), e)))
}

/// Origin agent recorded on a relay
pub fn origin_agent(relay: &Relay) -> Option<&str> {
    relay.labels().get(labels::ORIGIN_AGENT).map(String::as_str)
}

/// Drop metadata the API server owns; it is meaningless in another cluster
fn strip_server_fields(meta: &mut ObjectMeta) {
    meta.resource_version = None;
    meta.managed_fields = None;
    meta.generation = None;
    meta.owner_references = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointSlice};

    fn slice() -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                name: Some("cart".to_string()),
                namespace: Some("shop".to_string()),
                uid: Some("uid-1".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            endpoints: vec![Endpoint {
                addresses: vec!["10.1.0.1".to_string(), "10.1.0.2".to_string()],
                ..Default::default()
            }],
            ports: None,
        }
    }

    #[test]
    fn wrap_derives_identity_and_provenance() {
        let relay = wrap(&slice(), "cluster-a", "cart").unwrap();

        assert_eq!(relay.name_any(), "endpointslice.shop.cart");
        assert_eq!(relay.namespace().as_deref(), Some("relay-cluster-a"));
        let tags = relay.labels();
        assert_eq!(tags[labels::ORIGIN_KIND], "EndpointSlice");
        assert_eq!(tags[labels::ORIGIN_GROUP], "discovery.k8s.io");
        assert_eq!(tags[labels::ORIGIN_VERSION], "v1");
        assert_eq!(tags[labels::ORIGIN_UID], "uid-1");
        assert_eq!(tags[labels::ORIGIN_AGENT], "cluster-a");
        assert_eq!(tags[labels::SERVICE_NAME], "cart");
    }

    #[test]
    fn template_drops_server_managed_fields() {
        let relay = wrap(&slice(), "cluster-a", "cart").unwrap();
        let decoded: EndpointSlice = unwrap(&relay).unwrap();

        assert!(decoded.metadata.resource_version.is_none());
        assert_eq!(decoded.endpoints[0].addresses.len(), 2);
    }

    #[test]
    fn unwrap_rejects_kind_mismatch() {
        let relay = wrap(&slice(), "cluster-a", "cart").unwrap();
        let err = unwrap::<Service>(&relay).unwrap_err();
        assert!(matches!(err, CoreError::Template(_)));
    }

    #[test]
    fn unwrap_rejects_corrupt_template() {
        let mut relay = wrap(&slice(), "cluster-a", "cart").unwrap();
        relay.spec.template = "{not json".to_string();
        assert!(matches!(
            unwrap::<EndpointSlice>(&relay),
            Err(CoreError::Template(_))
        ));
    }

    #[test]
    fn wrap_requires_a_name() {
        let mut unnamed = slice();
        unnamed.metadata.name = None;
        assert!(matches!(
            wrap(&unnamed, "cluster-a", "cart"),
            Err(CoreError::MissingField("metadata.name"))
        ));
    }
}
