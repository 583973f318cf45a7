//! Error types for the network topology operator

use thiserror::Error;

/// Result type used throughout the operator
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// AWS API error
    #[error("aws error: {0}")]
    Aws(String),

    /// ARN parsing error
    #[error("invalid ARN '{arn}': {reason}")]
    InvalidArn { arn: String, reason: String },

    /// Invalid or unexpected object contents
    #[error("validation error: {0}")]
    Validation(String),

    /// Operator configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an AWS error from any displayable SDK error
    pub fn aws(err: impl std::fmt::Display) -> Self {
        Self::Aws(err.to_string())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// True if the underlying failure was a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aws_errors_keep_the_rendered_sdk_message() {
        let err = Error::aws("operation error DescribeTransitGateways: access denied");
        assert!(err.to_string().contains("aws error"));
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn not_found_is_only_detected_for_kubernetes_404s() {
        let api_err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "clusters.cluster.x-k8s.io \"missing\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(Error::from(api_err).is_not_found());

        let conflict = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });
        assert!(!Error::from(conflict).is_not_found());
        assert!(!Error::validation("anything").is_not_found());
    }

    #[test]
    fn invalid_arn_names_the_offending_value() {
        let err = Error::InvalidArn {
            arn: "tgw-123".to_string(),
            reason: "missing 'arn:' prefix".to_string(),
        };
        assert!(err.to_string().contains("tgw-123"));
        assert!(err.to_string().contains("missing 'arn:' prefix"));
    }
}
