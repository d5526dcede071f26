//! Cluster identities and routing policy
//!
//! A [`ClusterIdentity`] is everything the credential and settings stores know
//! about one cluster. It is loaded once per cluster instance and never
//! mutated afterwards.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Namespace used when a cluster's policy does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Per-cluster routing policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterPolicy {
    /// Overrides the kubeconfig server URL for all API traffic
    pub api_proxy_url: Option<String>,
    /// Talk plain HTTP to the API server
    pub api_proxy_force_http: bool,
    /// Never route workload traffic through the API server proxy subresource
    pub disable_api_proxy: bool,
    /// Prefer pods/{pod}/proxy over services/{svc}/proxy when a pod is found
    pub prefer_pod_proxy: bool,
    /// Try a local port-forward before the API server proxy
    pub use_port_forward: bool,
    /// Namespace workloads live in
    pub namespace: String,
}

impl Default for ClusterPolicy {
    fn default() -> Self {
        Self {
            api_proxy_url: None,
            api_proxy_force_http: false,
            disable_api_proxy: false,
            prefer_pod_proxy: false,
            use_port_forward: false,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl ClusterPolicy {
    /// Namespace with blank values mapped to the default
    pub fn namespace(&self) -> &str {
        let ns = self.namespace.trim();
        if ns.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            ns
        }
    }

    /// The API URL override, ignoring blank values
    pub fn api_proxy_url(&self) -> Option<&str> {
        self.api_proxy_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

/// Credentials for joining a cluster's overlay network
#[derive(Clone)]
pub struct OverlayCredentials {
    /// Control-plane (login server) URL
    pub login_server: String,
    /// Pre-authorized key. Only needed until the node identity is persisted.
    pub auth_key: Option<Zeroizing<String>>,
    /// Explicit state directory; derived from the state root when None
    pub state_dir: Option<PathBuf>,
    /// Prefix for the overlay device hostname
    pub hostname_prefix: String,
}

impl fmt::Debug for OverlayCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayCredentials")
            .field("login_server", &self.login_server)
            .field("auth_key", &self.auth_key.as_ref().map(|_| "<redacted>"))
            .field("state_dir", &self.state_dir)
            .field("hostname_prefix", &self.hostname_prefix)
            .finish()
    }
}

/// Everything known about one cluster
#[derive(Clone)]
pub struct ClusterIdentity {
    /// Stable cluster ID
    pub id: String,
    /// Kubeconfig YAML
    pub kubeconfig: Zeroizing<String>,
    /// Overlay credentials; None means the API server and workloads are
    /// reachable from the host network directly
    pub overlay: Option<OverlayCredentials>,
    /// Routing policy
    pub policy: ClusterPolicy,
    /// Per-workload address overrides (`host[:port]`), keyed by workload ID
    pub overrides: HashMap<String, String>,
}

impl ClusterIdentity {
    /// Identity with default policy and no overlay
    pub fn new(id: impl Into<String>, kubeconfig: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kubeconfig: Zeroizing::new(kubeconfig.into()),
            overlay: None,
            policy: ClusterPolicy::default(),
            overrides: HashMap::new(),
        }
    }

    /// Replace the routing policy
    pub fn with_policy(mut self, policy: ClusterPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Attach overlay credentials
    pub fn with_overlay(mut self, overlay: OverlayCredentials) -> Self {
        self.overlay = Some(overlay);
        self
    }
}

impl fmt::Debug for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterIdentity")
            .field("id", &self.id)
            .field("kubeconfig", &"<redacted>")
            .field("overlay", &self.overlay)
            .field("policy", &self.policy)
            .field("overrides", &self.overrides)
            .finish()
    }
}
