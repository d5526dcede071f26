//! Error taxonomy shared by every corridor crate
//!
//! Each crate keeps its own `thiserror` enum with structured context, and
//! reports which [`ErrorClass`] a value belongs to. The class decides how a
//! failure propagates:
//! - `Config`: bad or missing kubeconfig/overlay credentials; fatal for that
//!   cluster until the next lookup
//! - `Connect`: overlay join or API server reachability; may be transient
//! - `Resolution`: the target could not be named or found; never retried
//! - `Transport`: the chosen data path failed; eligible for one fallback hop
//! - `Protocol`: the request itself cannot be served as asked

use thiserror::Error;

/// Default context value when no specific cluster is known
pub const UNKNOWN_CLUSTER: &str = "unknown";

/// Coarse failure class used for propagation decisions and status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Bad or missing cluster configuration
    Config,
    /// Overlay or API server connectivity
    Connect,
    /// Target naming or lookup
    Resolution,
    /// Upstream data path
    Transport,
    /// Unsupported or oversized request
    Protocol,
}

impl ErrorClass {
    /// Short lowercase label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Config => "config",
            ErrorClass::Connect => "connect",
            ErrorClass::Resolution => "resolution",
            ErrorClass::Transport => "transport",
            ErrorClass::Protocol => "protocol",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every corridor error type
pub trait Classify {
    /// Which class this failure belongs to
    fn class(&self) -> ErrorClass;

    /// Whether retrying later (not immediately) may succeed
    fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Connect | ErrorClass::Transport)
    }
}

/// Errors raised while turning a cluster identity into client configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Kubeconfig material could not be parsed or applied
    #[error("invalid kubeconfig for cluster {cluster}: {message}")]
    Kubeconfig {
        /// Cluster whose kubeconfig is invalid
        cluster: String,
        /// What went wrong
        message: String,
    },

    /// An API endpoint override is not a valid URL
    #[error("invalid API endpoint '{endpoint}' for cluster {cluster}: {message}")]
    Endpoint {
        /// Cluster the override belongs to
        cluster: String,
        /// The rejected endpoint
        endpoint: String,
        /// What went wrong
        message: String,
    },

    /// The credential store has no usable entry for this cluster
    #[error("missing credentials for cluster {cluster}: {message}")]
    MissingCredentials {
        /// Cluster that was looked up
        cluster: String,
        /// What is missing
        message: String,
    },

    /// No cluster with this ID is configured
    #[error("unknown cluster {0}")]
    UnknownCluster(String),
}

impl ConfigError {
    /// Create a kubeconfig error for a cluster
    pub fn kubeconfig(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Kubeconfig {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an endpoint error for a cluster
    pub fn endpoint(
        cluster: impl Into<String>,
        endpoint: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Endpoint {
            cluster: cluster.into(),
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a missing-credentials error for a cluster
    pub fn missing(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MissingCredentials {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// The cluster this error refers to
    pub fn cluster(&self) -> &str {
        match self {
            Self::Kubeconfig { cluster, .. }
            | Self::Endpoint { cluster, .. }
            | Self::MissingCredentials { cluster, .. }
            | Self::UnknownCluster(cluster) => cluster,
        }
    }
}

impl Classify for ConfigError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Config
    }
}
