//! Per-cluster connectivity for corridor
//!
//! # Architecture
//!
//! ```text
//! ClusterRegistry ──► ClusterInstance (one per cluster ID)
//!                       ├── ClusterConnector   (overlay or direct network route)
//!                       ├── DialService        (loopback → OS, else → connector)
//!                       ├── kube::Client / ApiTransport / WorkloadClient
//!                       └── PortForwardManager (local ports → pods/portforward)
//! ```
//!
//! - [`connector`] - network routes into a cluster and their state directories
//! - [`transport`] - HTTP clients built on a cluster's dial hook
//! - [`portforward`] - cached local port-forwards to pod ports
//! - [`relay`] - bidirectional byte relay with cancellation
//! - [`registry`] - single-flight construction and teardown of instances

#![deny(missing_docs)]

pub mod connector;
pub mod error;
pub mod portforward;
pub mod registry;
pub mod relay;
pub mod transport;

pub use connector::{BoxedIo, ClusterConnector, ConnectorHealth, HealthState};
pub use error::{ConnectorError, ForwardError, RegistryError};
pub use portforward::{ForwardConfig, PortForwardManager};
pub use registry::{ClusterInstance, ClusterRegistry, ClusterStatus, IdentitySource, RegistrySettings};
pub use relay::bridge;
pub use transport::{ApiTransport, BoxError, DialService, ProxyBody, WorkloadClient};
