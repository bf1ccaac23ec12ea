use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflicting update: {0}")]
    Conflict(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid relay template: {0}")]
    Template(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// True for a missing object, whether reported locally or by the API server
    pub fn is_not_found(&self) -> bool {
        match self {
            CoreError::NotFound(_) => true,
            CoreError::KubernetesError(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// Map an API error response onto the matching variant
    pub(crate) fn from_kube(err: kube::Error, subject: &str) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => CoreError::NotFound(subject.to_string()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                CoreError::AlreadyExists(subject.to_string())
            }
            kube::Error::Api(ae) if ae.code == 409 => {
                CoreError::Conflict(format!("{}: {}", subject, ae.message))
            }
            other => CoreError::KubernetesError(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn not_found_is_detected_from_both_sources() {
        assert!(CoreError::NotFound("x".to_string()).is_not_found());
        assert!(CoreError::KubernetesError(api_error(404, "NotFound")).is_not_found());
        assert!(!CoreError::Internal("x".to_string()).is_not_found());
    }

    #[test]
    fn conflict_codes_map_to_distinct_variants() {
        assert!(matches!(
            CoreError::from_kube(api_error(409, "AlreadyExists"), "ns/a"),
            CoreError::AlreadyExists(_)
        ));
        assert!(matches!(
            CoreError::from_kube(api_error(409, "Conflict"), "ns/a"),
            CoreError::Conflict(_)
        ));
        assert!(matches!(
            CoreError::from_kube(api_error(500, "InternalError"), "ns/a"),
            CoreError::KubernetesError(_)
        ));
    }
}
