//! Per-cluster network connectors
//!
//! A [`ClusterConnector`] owns the route into one cluster's private network.
//! Two implementations exist:
//! - [`DirectConnector`]: the host network already routes to the cluster
//! - [`OverlayConnector`]: a private overlay node per cluster, with its own
//!   identity and state directory
//!
//! Connectors never share state across cluster IDs.

mod direct;
mod overlay;
mod state_dir;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ConnectorError;

pub use direct::DirectConnector;
pub(crate) use direct::dial_tcp;
pub use overlay::{OverlayConnector, OverlaySettings};
pub use state_dir::{LockError, StateDir, StateLock, StateRoot};

/// Byte stream returned by a dial
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// Owned, type-erased connection
pub type BoxedIo = Box<dyn Io>;

/// Coarse connector state for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Not started, or stopped
    Stopped,
    /// Joining the overlay
    Starting,
    /// Running but not fully connected
    Degraded,
    /// Connected
    Ok,
}

/// Diagnostic details reported alongside [`HealthState`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthDetails {
    /// Cluster the connector belongs to
    pub cluster_id: String,
    /// Overlay state directory, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
    /// Overlay control plane URL, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_server: Option<String>,
    /// Our overlay address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Our overlay DNS name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
    /// Number of reachable peers
    pub online_peers: usize,
}

/// Health report from [`ClusterConnector::health`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorHealth {
    /// Current state
    pub state: HealthState,
    /// Extra detail when not Ok
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Identity and connectivity details
    pub details: HealthDetails,
}

impl ConnectorHealth {
    /// Health report in the given state with no message
    pub fn new(state: HealthState, details: HealthDetails) -> Self {
        Self {
            state,
            message: None,
            details,
        }
    }

    /// Attach a message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Route into one cluster's private network
///
/// Dials are TCP only. Cancellation follows the caller: dropping the
/// returned future abandons the dial.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Join the network. Calling again on a started connector is a no-op.
    async fn start(&self) -> Result<(), ConnectorError>;

    /// Open a TCP connection to `addr` (`host:port`) through this cluster's
    /// network, bounded by the connector's dial timeout
    async fn dial(&self, addr: &str) -> Result<BoxedIo, ConnectorError>;

    /// Report connectivity for diagnostics
    async fn health(&self) -> ConnectorHealth;

    /// Leave the network and release the state directory lock. Idempotent.
    async fn stop(&self) -> Result<(), ConnectorError>;

    /// Directory holding this connector's persisted identity, if any
    fn state_dir(&self) -> Option<PathBuf>;
}
