use rustrial_k8s_replica_guard_runtime::AccessError;

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Invalid environment configuration
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// The object exists but is not selected by `WATCH_LABEL_SELECTOR`
    #[error("{0} does not match the label selector")]
    OutOfScope(String),
}

impl AccessError for ControllerError {
    fn is_not_found(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_not_found(),
            ControllerError::Configuration(_) => false,
            ControllerError::OutOfScope(_) => true,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_conflict(),
            ControllerError::Configuration(_) | ControllerError::OutOfScope(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> ControllerError {
        ControllerError::KubeApi(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} (test)", reason),
            reason: reason.to_string(),
            code,
        }))
    }

    #[test]
    fn classify_api_errors() {
        let not_found = api_error(404, "NotFound");
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        assert!(api_error(410, "Gone").is_not_found());

        let conflict = api_error(409, "Conflict");
        assert!(conflict.is_conflict());
        assert!(!conflict.is_not_found());

        let unavailable = api_error(503, "ServiceUnavailable");
        assert!(!unavailable.is_conflict());
        assert!(!unavailable.is_not_found());

        let other = ControllerError::Configuration("WORKERS must be at least 1".to_string());
        assert!(!other.is_conflict());
        assert!(!other.is_not_found());
        assert_eq!(
            "invalid configuration: WORKERS must be at least 1",
            other.to_string()
        );

        let unselected = ControllerError::OutOfScope("test/web".to_string());
        assert!(unselected.is_not_found());
        assert!(!unselected.is_conflict());
    }
}
