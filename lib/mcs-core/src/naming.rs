//! Deterministic naming and labeling of relays and derived objects
//!
//! Every name produced here is a pure function of its inputs, so re-deriving
//! the same source object always lands on the same relay or derived object and
//! upserts stay idempotent.

use std::collections::BTreeMap;

use mcs_api::labels;
use sha2::{Digest, Sha256};

/// Label map as stored in object metadata
pub type Labels = BTreeMap<String, String>;

/// Maximum length of a DNS subdomain object name
pub const MAX_NAME_LEN: usize = 253;
/// Maximum length of a DNS label (Service names)
pub const MAX_LABEL_LEN: usize = 63;

const HASH_SUFFIX_LEN: usize = 10;

/// Name of the relay carrying `kind` `namespace/name`.
///
/// The kind is lowercased because object names must be lowercase.
pub fn relay_name(kind: &str, namespace: &str, name: &str) -> String {
    let kind = kind.to_ascii_lowercase();
    if namespace.is_empty() {
        format!("{}.{}", kind, name)
    } else {
        format!("{}.{}.{}", kind, namespace, name)
    }
}

/// Parent namespace holding the relays of one agent
pub fn relay_namespace(agent_id: &str) -> String {
    format!("relay-{}", agent_id)
}

/// Local name of an object materialized from a remote cluster
pub fn derived_name(remote_name: &str, agent_id: &str) -> String {
    shorten(&format!("{}-{}", remote_name, agent_id), MAX_NAME_LEN)
}

/// Name of the locally materialized Service for an import
pub fn derived_service_name(import_name: &str) -> String {
    shorten(&format!("derived-{}", import_name), MAX_LABEL_LEN)
}

/// Truncate `name` to `max` characters, keeping it unique with a hash suffix
fn shorten(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let mut keep = max - HASH_SUFFIX_LEN - 1;
    while !name.is_char_boundary(keep) {
        keep -= 1;
    }
    let prefix = name[..keep].trim_end_matches(|c: char| c == '-' || c == '.');
    format!("{}-{}", prefix, &digest[..HASH_SUFFIX_LEN])
}

/// True for a valid DNS-1123 subdomain, the form object names must take
pub fn is_dns_subdomain(name: &str) -> bool {
    let alphanumeric = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.split('.').all(|part| {
            part.starts_with(alphanumeric)
                && part.ends_with(alphanumeric)
                && part.chars().all(|c| alphanumeric(c) || c == '-')
        })
}

/// Selector matching every relay one agent published for a service
pub fn relay_selector(agent_id: &str, service: &str, namespace: &str, kind: &str) -> Labels {
    Labels::from([
        (labels::ORIGIN_AGENT.to_string(), agent_id.to_string()),
        (labels::SERVICE_NAME.to_string(), service.to_string()),
        (labels::ORIGIN_NAMESPACE.to_string(), namespace.to_string()),
        (labels::ORIGIN_KIND.to_string(), kind.to_string()),
    ])
}

/// Selector matching the relays of a service from every agent
pub fn import_relay_selector(namespace: &str, service: &str, kind: &str) -> Labels {
    Labels::from([
        (labels::ORIGIN_NAMESPACE.to_string(), namespace.to_string()),
        (labels::ORIGIN_KIND.to_string(), kind.to_string()),
        (labels::SERVICE_NAME.to_string(), service.to_string()),
    ])
}

/// Selector matching the EndpointSlices this controller derived for a Service
pub fn derived_slice_selector(derived_service: &str) -> Labels {
    Labels::from([
        (labels::CREATED_BY.to_string(), labels::CONTROLLER_NAME.to_string()),
        (labels::K8S_SERVICE_NAME.to_string(), derived_service.to_string()),
    ])
}

/// Render a label map as an equality-based selector (`k=v,k=v`)
pub fn selector_string(selector: &Labels) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// True for objects this controller materialized from relays
pub fn is_derived(tags: &Labels) -> bool {
    tags.get(labels::CREATED_BY).map(String::as_str) == Some(labels::CONTROLLER_NAME)
}

/// True when every selector pair is present in `labels`
pub fn labels_match(labels: Option<&Labels>, selector: &Labels) -> bool {
    selector.iter().all(|(k, v)| {
        labels
            .and_then(|l| l.get(k))
            .map(|actual| actual == v)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_name_includes_namespace_when_present() {
        assert_eq!(
            relay_name("EndpointSlice", "shop", "cart"),
            "endpointslice.shop.cart"
        );
        assert_eq!(relay_name("Namespace", "", "shop"), "namespace.shop");
    }

    #[test]
    fn relay_name_is_stable() {
        let a = relay_name("EndpointSlice", "shop", "cart-x7k2p");
        let b = relay_name("EndpointSlice", "shop", "cart-x7k2p");
        assert_eq!(a, b);
    }

    #[test]
    fn relay_namespace_is_prefixed() {
        assert_eq!(relay_namespace("cluster-a"), "relay-cluster-a");
    }

    #[test]
    fn derived_names_differ_per_agent() {
        assert_eq!(derived_name("cart-x7k2p", "a"), "cart-x7k2p-a");
        assert_ne!(derived_name("cart", "a"), derived_name("cart", "b"));
    }

    #[test]
    fn long_names_are_shortened_deterministically() {
        let long = "s".repeat(80);
        let first = derived_service_name(&long);
        let second = derived_service_name(&long);
        assert_eq!(first, second);
        assert_eq!(first.len(), MAX_LABEL_LEN);
        assert!(first.starts_with("derived-sss"));

        let other = derived_service_name(&format!("{}t", long));
        assert_ne!(first, other);
    }

    #[test]
    fn shortening_does_not_leave_trailing_separator() {
        // 52 chars kept before the suffix; make the 52nd a dash
        let name = format!("{}-{}", "a".repeat(51), "b".repeat(30));
        let short = shorten(&name, MAX_LABEL_LEN);
        assert!(!short.contains("--"));
    }

    #[test]
    fn shortening_cuts_on_a_char_boundary() {
        let name = format!("a{}", "é".repeat(200));
        let short = derived_name(&name, "cluster-a");
        assert!(short.len() <= MAX_NAME_LEN);
        assert!(short.starts_with("aé"));
    }

    #[test]
    fn dns_subdomains_are_lowercase_alphanumeric_segments() {
        assert!(is_dns_subdomain("cart-x7k2p"));
        assert!(is_dns_subdomain("cart.x7k2p"));
        assert!(!is_dns_subdomain(""));
        assert!(!is_dns_subdomain("Cart"));
        assert!(!is_dns_subdomain("-cart"));
        assert!(!is_dns_subdomain("cart..x"));
        assert!(!is_dns_subdomain("café"));
        assert!(!is_dns_subdomain(&"a".repeat(MAX_NAME_LEN + 1)));
    }

    #[test]
    fn selector_string_is_sorted_by_key() {
        let selector = Labels::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        assert_eq!(selector_string(&selector), "a=1,b=2");
    }

    #[test]
    fn derived_objects_are_recognised_by_created_by() {
        assert!(is_derived(&derived_slice_selector("derived-cart")));
        assert!(!is_derived(&Labels::new()));
    }

    #[test]
    fn labels_match_requires_every_pair() {
        let selector = relay_selector("a", "cart", "shop", "EndpointSlice");
        let mut labels = selector.clone();
        labels.insert("extra".to_string(), "x".to_string());
        assert!(labels_match(Some(&labels), &selector));

        labels.insert(mcs_api::labels::ORIGIN_AGENT.to_string(), "b".to_string());
        assert!(!labels_match(Some(&labels), &selector));
        assert!(!labels_match(None, &selector));
        assert!(labels_match(None, &Labels::new()));
    }
}
