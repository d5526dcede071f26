//! Corridor reverse proxy
//!
//! One HTTPS origin in front of workloads in many private clusters.
//!
//! # Request path
//!
//! ```text
//! browser ──► ProxyEngine ──► ServiceResolver ──► ApiProxyAdapter ──► dispatch
//!             (parse form)    (status/Service/     (port-forward,      (one fallback
//!                              override/DNS)        pod/service proxy)  hop)
//! ```
//!
//! # Endpoints
//!
//! - `* /proxy/...` - proxy through the default cluster
//! - `* /api/cluster/{cluster}/proxy/...` - proxy through a named cluster
//! - `GET /api/clusters` - status of every cluster instance
//! - `DELETE /api/clusters/{cluster}` - tear a cluster instance down
//! - `GET /healthz` - health check

#![deny(missing_docs)]

pub mod api_proxy;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod rewrite;
pub mod routing;
pub mod server;
pub mod strategy;
pub mod upgrade;

pub use api_proxy::{ApiProxyAdapter, ForwardProvider};
pub use catalog::{KubeCatalog, WorkloadCatalog};
pub use engine::{ClusterBackend, ClusterDirectory, EngineConfig, ProxyEngine, RegistryDirectory};
pub use error::{ProxyError, Result};
pub use resolver::{ResolvedTarget, ServiceResolver, TargetSource};
pub use routing::{parse_route, ProxyRoute, Target};
pub use server::{router, serve, ServerConfig, ServerError, TlsFiles};
pub use strategy::{Attempt, Plan, Strategy, Upstream, Via};
