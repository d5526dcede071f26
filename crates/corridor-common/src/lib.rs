//! Shared building blocks for corridor
//!
//! - [`identity`] - cluster identities, overlay credentials and routing policy
//! - [`kubeconfig`] - kube client configuration with endpoint policy applied
//! - [`names`] - DNS-1123 name sanitization
//! - [`net`] - loopback, host:port and scheme rules
//! - [`error`] - the error taxonomy every crate classifies into
//! - [`telemetry`] - tracing subscriber and OTLP export setup

#![deny(missing_docs)]

pub mod error;
pub mod identity;
pub mod kubeconfig;
pub mod names;
pub mod net;
pub mod telemetry;

pub use error::{Classify, ConfigError, ErrorClass};
pub use identity::{ClusterIdentity, ClusterPolicy, OverlayCredentials, DEFAULT_NAMESPACE};

/// Label used to find a workload's Service when its name differs from the ID
pub const WORKLOAD_ID_LABEL: &str = "corridor.io/id";

/// Header carrying the fallback `host:port` stashed by a port-forward rewrite
pub const FALLBACK_HOSTPORT_HEADER: &str = "x-corridor-fallback-hostport";

/// Header carrying the fallback scheme stashed by a port-forward rewrite
pub const FALLBACK_SCHEME_HEADER: &str = "x-corridor-fallback-scheme";
