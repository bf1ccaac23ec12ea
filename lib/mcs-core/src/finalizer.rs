//! Finalizer bookkeeping on object metadata

use kube::Resource;

/// True once the API server has stamped a deletion timestamp
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|name| name == finalizer))
        .unwrap_or(false)
}

/// Add `finalizer`, returning false when it was already present
pub fn add_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Remove `finalizer`, returning false when it was absent
pub fn remove_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    if !has_finalizer(obj, finalizer) {
        return false;
    }
    if let Some(finalizers) = obj.meta_mut().finalizers.as_mut() {
        finalizers.retain(|name| name != finalizer);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcs_api::ServiceExport;

    const FINALIZER: &str = "example.com/cleanup";

    #[test]
    fn add_is_idempotent() {
        let mut export = ServiceExport::default();
        assert!(add_finalizer(&mut export, FINALIZER));
        assert!(!add_finalizer(&mut export, FINALIZER));
        assert_eq!(export.metadata.finalizers.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn remove_keeps_foreign_finalizers() {
        let mut export = ServiceExport::default();
        export.metadata.finalizers = Some(vec!["other".to_string(), FINALIZER.to_string()]);

        assert!(remove_finalizer(&mut export, FINALIZER));
        assert!(!remove_finalizer(&mut export, FINALIZER));
        assert_eq!(export.metadata.finalizers, Some(vec!["other".to_string()]));
    }

    #[test]
    fn deleting_follows_deletion_timestamp() {
        let mut export = ServiceExport::default();
        assert!(!is_deleting(&export));
        export.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        assert!(is_deleting(&export));
    }
}
