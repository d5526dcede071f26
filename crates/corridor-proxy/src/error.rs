//! Error types for the reverse proxy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use corridor_cluster::RegistryError;
use corridor_common::{Classify, ConfigError, ErrorClass};

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The request does not name a usable target
    #[error("bad target: {0}")]
    BadTarget(String),

    /// No resolution step produced an address for the workload
    #[error("workload {workload} not resolved in namespace {namespace}")]
    TargetNotResolved {
        /// Workload identifier as requested
        workload: String,
        /// Namespace searched
        namespace: String,
    },

    /// The request body exceeds the configured cap
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Cap in bytes
        limit: usize,
    },

    /// The request cannot be streamed as asked
    #[error("streaming unsupported: {0}")]
    StreamingUnsupported(String),

    /// The inbound request body could not be read
    #[error("failed to read request body: {0}")]
    RequestBody(String),

    /// Every attempted data path failed
    #[error("upstream {target} unreachable: {message}")]
    UpstreamUnreachable {
        /// Last address tried
        target: String,
        /// What failed
        message: String,
    },

    /// A workspace or Service lookup against the cluster API failed
    #[error("lookup for workload {workload} failed: {source}")]
    Catalog {
        /// Workload identifier being resolved
        workload: String,
        /// Cluster API error
        source: kube::Error,
    },

    /// The cluster instance could not be obtained
    #[error(transparent)]
    Cluster(#[from] RegistryError),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Create an upstream-unreachable error
    pub fn unreachable(target: impl Into<String>, msg: impl ToString) -> Self {
        Self::UpstreamUnreachable {
            target: target.into(),
            message: msg.to_string(),
        }
    }

    /// Create a lookup error for `workload`
    pub fn catalog(workload: impl Into<String>, source: kube::Error) -> Self {
        Self::Catalog {
            workload: workload.into(),
            source,
        }
    }

    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadTarget(_) | Self::RequestBody(_) => StatusCode::BAD_REQUEST,
            Self::TargetNotResolved { .. } => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::StreamingUnsupported(_) => StatusCode::NOT_IMPLEMENTED,
            Self::UpstreamUnreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::Catalog { .. } => match self.class() {
                ErrorClass::Config => StatusCode::BAD_GATEWAY,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Cluster(RegistryError::Config(ConfigError::UnknownCluster(_))) => {
                StatusCode::BAD_REQUEST
            }
            Self::Cluster(e) => match e.class() {
                ErrorClass::Config => StatusCode::BAD_GATEWAY,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Classify for ProxyError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::BadTarget(_) | Self::TargetNotResolved { .. } => ErrorClass::Resolution,
            Self::PayloadTooLarge { .. }
            | Self::StreamingUnsupported(_)
            | Self::RequestBody(_) => ErrorClass::Protocol,
            Self::UpstreamUnreachable { .. } => ErrorClass::Transport,
            // Rejected credentials are a cluster configuration problem
            Self::Catalog {
                source: kube::Error::Api(response),
                ..
            } if matches!(response.code, 401 | 403) => ErrorClass::Config,
            Self::Catalog { .. } => ErrorClass::Connect,
            Self::Cluster(RegistryError::Config(ConfigError::UnknownCluster(_))) => {
                ErrorClass::Resolution
            }
            Self::Cluster(e) => e.class(),
            Self::Internal(_) => ErrorClass::Protocol,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Return K8s-style Status response
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": self.to_string(),
            "reason": self.class().as_str(),
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corridor_cluster::ConnectorError;
    use http_body_util::BodyExt;
    use rstest::rstest;

    #[rstest]
    #[case(ProxyError::BadTarget("invalid port".into()), 400)]
    #[case(ProxyError::TargetNotResolved { workload: "ws1".into(), namespace: "default".into() }, 404)]
    #[case(ProxyError::PayloadTooLarge { limit: 10 }, 413)]
    #[case(ProxyError::StreamingUnsupported("no upgrade".into()), 501)]
    #[case(ProxyError::unreachable("10.0.0.1:80", "refused"), 502)]
    #[case(ProxyError::Cluster(ConfigError::kubeconfig("c1", "bad").into()), 502)]
    #[case(ProxyError::Cluster(ConnectorError::unreachable("c1", "down").into()), 503)]
    #[case(ProxyError::Cluster(ConfigError::UnknownCluster("c9".into()).into()), 400)]
    #[case(ProxyError::Internal("boom".into()), 500)]
    fn status_codes(#[case] err: ProxyError, #[case] code: u16) {
        assert_eq!(err.status().as_u16(), code);
    }

    #[test]
    fn catalog_errors_are_classified_by_cause() {
        let down = ProxyError::catalog("ws1", kube::Error::Service("connection refused".into()));
        assert_eq!(down.class(), ErrorClass::Connect);
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(down.to_string().contains("ws1"));

        let forbidden = ProxyError::catalog(
            "ws1",
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "forbidden".into(),
                reason: "Forbidden".into(),
                code: 403,
            }),
        );
        assert_eq!(forbidden.class(), ErrorClass::Config);
        assert_eq!(forbidden.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn response_is_a_status_object() {
        let response = ProxyError::PayloadTooLarge { limit: 16 }.into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["kind"], "Status");
        assert_eq!(json["status"], "Failure");
        assert_eq!(json["code"], 413);
        assert_eq!(json["reason"], "protocol");
    }
}
