//! Corridor - one HTTPS origin in front of workloads in many private clusters
//!
//! The binary wires three crates together:
//! - `corridor-common` - identities, policy and telemetry
//! - `corridor-cluster` - per-cluster connectors, clients and port-forwards
//! - `corridor-proxy` - target resolution, routing strategies and the HTTP server
//!
//! This crate holds the process configuration file and the identity source
//! built from it.

#![deny(missing_docs)]

pub mod config;

pub use config::{Config, ConfigFileError, FileIdentitySource};
