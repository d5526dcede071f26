//! Error types for per-cluster connectivity

use std::time::Duration;

use corridor_common::{Classify, ConfigError, ErrorClass};
use thiserror::Error;

/// Errors from a [`ClusterConnector`](crate::connector::ClusterConnector)
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The overlay control plane rejected our credentials, or none were given
    #[error("overlay authentication failed for cluster {cluster}: {message}")]
    Auth {
        /// Cluster being joined
        cluster: String,
        /// What the control plane or local checks reported
        message: String,
    },

    /// The overlay control plane could not be reached or never reported ready
    #[error("overlay control plane unreachable for cluster {cluster}: {message}")]
    ControlPlaneUnreachable {
        /// Cluster being joined
        cluster: String,
        /// What failed
        message: String,
    },

    /// Another connector holds this cluster's state directory
    #[error("overlay for cluster {cluster} already started by pid {holder}")]
    AlreadyStarted {
        /// Cluster whose state directory is locked
        cluster: String,
        /// Process holding the lock
        holder: u32,
    },

    /// No connection within the dial bound
    #[error("dial {addr} in cluster {cluster} timed out after {timeout:?}")]
    DialTimeout {
        /// Cluster the dial went through
        cluster: String,
        /// Destination
        addr: String,
        /// Bound that elapsed
        timeout: Duration,
    },

    /// The overlay has no route to the destination
    #[error("no route to {addr} in cluster {cluster}: {message}")]
    NoRoute {
        /// Cluster the dial went through
        cluster: String,
        /// Destination
        addr: String,
        /// Reason reported by the network stack or egress proxy
        message: String,
    },

    /// `dial` or `health` was used before `start`
    #[error("connector for cluster {cluster} is not started")]
    NotStarted {
        /// Cluster whose connector is stopped
        cluster: String,
    },

    /// Local setup failed (state directory, daemon binary, process control)
    #[error("overlay setup failed for cluster {cluster}: {message}")]
    Setup {
        /// Cluster being joined
        cluster: String,
        /// What failed
        message: String,
    },
}

impl ConnectorError {
    /// Create an auth error
    pub fn auth(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Auth {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a control-plane-unreachable error
    pub fn unreachable(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ControlPlaneUnreachable {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a no-route error
    pub fn no_route(
        cluster: impl Into<String>,
        addr: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::NoRoute {
            cluster: cluster.into(),
            addr: addr.into(),
            message: msg.into(),
        }
    }

    /// Create a setup error
    pub fn setup(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Setup {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }
}

impl Classify for ConnectorError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Auth { .. } | Self::AlreadyStarted { .. } | Self::Setup { .. } => {
                ErrorClass::Config
            }
            Self::ControlPlaneUnreachable { .. } | Self::NotStarted { .. } => ErrorClass::Connect,
            Self::DialTimeout { .. } | Self::NoRoute { .. } => ErrorClass::Transport,
        }
    }
}

/// Errors from the [`PortForwardManager`](crate::portforward::PortForwardManager)
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The tunnel did not become ready within the bound
    #[error("port-forward to {namespace}/{pod}:{port} not ready after {timeout:?}")]
    ForwardStartTimeout {
        /// Pod namespace
        namespace: String,
        /// Pod name
        pod: String,
        /// Container port
        port: u16,
        /// Bound that elapsed
        timeout: Duration,
    },

    /// The API server refused or failed the upgrade
    #[error("port-forward to {namespace}/{pod}:{port} failed: {message}")]
    Tunnel {
        /// Pod namespace
        namespace: String,
        /// Pod name
        pod: String,
        /// Container port
        port: u16,
        /// What failed
        message: String,
    },

    /// No local listener could be bound
    #[error("failed to bind local port-forward listener: {0}")]
    Bind(#[source] std::io::Error),
}

impl Classify for ForwardError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::ForwardStartTimeout { .. } | Self::Tunnel { .. } => ErrorClass::Transport,
            Self::Bind(_) => ErrorClass::Connect,
        }
    }
}

/// Errors from the [`ClusterRegistry`](crate::registry::ClusterRegistry)
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Identity or kubeconfig could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The cluster's connector failed to start
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Clients could not be built from the configuration
    #[error("failed to build clients for cluster {cluster}: {message}")]
    Client {
        /// Cluster being constructed
        cluster: String,
        /// What failed
        message: String,
    },

    /// The cluster is being closed
    #[error("cluster {0} is closing")]
    Closed(String),
}

impl RegistryError {
    /// Create a client-construction error
    pub fn client(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Client {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }
}

impl Classify for RegistryError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Config(e) => e.class(),
            Self::Connector(e) => e.class(),
            Self::Client { .. } => ErrorClass::Config,
            Self::Closed(_) => ErrorClass::Connect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_failures_are_transport_and_transient() {
        let err = ConnectorError::no_route("c1", "10.0.0.1:80", "host unreachable");
        assert_eq!(err.class(), ErrorClass::Transport);
        assert!(err.is_transient());
    }

    #[test]
    fn auth_failures_are_fatal_config() {
        let err = ConnectorError::auth("c1", "invalid key");
        assert_eq!(err.class(), ErrorClass::Config);
        assert!(!err.is_transient());
    }

    #[test]
    fn registry_errors_inherit_inner_class() {
        let err: RegistryError = ConnectorError::unreachable("c1", "timeout").into();
        assert_eq!(err.class(), ErrorClass::Connect);
        let err: RegistryError = ConfigError::kubeconfig("c1", "bad").into();
        assert_eq!(err.class(), ErrorClass::Config);
    }

    #[test]
    fn forward_timeout_names_the_target() {
        let err = ForwardError::ForwardStartTimeout {
            namespace: "default".into(),
            pod: "p1".into(),
            port: 8080,
            timeout: Duration::from_secs(8),
        };
        assert!(err.to_string().contains("default/p1:8080"));
        assert_eq!(err.class(), ErrorClass::Transport);
    }
}
