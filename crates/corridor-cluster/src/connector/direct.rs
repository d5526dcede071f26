//! Connector for clusters routable from the host network

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::{BoxedIo, ClusterConnector, ConnectorHealth, HealthDetails, HealthState};
use crate::error::ConnectorError;

/// Dials through the operating system network stack
pub struct DirectConnector {
    cluster_id: String,
    dial_timeout: Duration,
    started: AtomicBool,
}

impl DirectConnector {
    /// Create a connector for `cluster_id`
    pub fn new(cluster_id: impl Into<String>, dial_timeout: Duration) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            dial_timeout,
            started: AtomicBool::new(false),
        }
    }
}

/// Dial `addr` on the host network with a bound, classifying failures
pub(crate) async fn dial_tcp(
    cluster_id: &str,
    addr: &str,
    timeout: Duration,
) -> Result<TcpStream, ConnectorError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => match e.kind() {
            ErrorKind::TimedOut => Err(ConnectorError::DialTimeout {
                cluster: cluster_id.to_string(),
                addr: addr.to_string(),
                timeout,
            }),
            _ => Err(ConnectorError::no_route(cluster_id, addr, e.to_string())),
        },
        Err(_) => Err(ConnectorError::DialTimeout {
            cluster: cluster_id.to_string(),
            addr: addr.to_string(),
            timeout,
        }),
    }
}

#[async_trait]
impl ClusterConnector for DirectConnector {
    async fn start(&self) -> Result<(), ConnectorError> {
        if !self.started.swap(true, Ordering::SeqCst) {
            debug!(cluster = %self.cluster_id, "Direct connector started");
        }
        Ok(())
    }

    async fn dial(&self, addr: &str) -> Result<BoxedIo, ConnectorError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(ConnectorError::NotStarted {
                cluster: self.cluster_id.clone(),
            });
        }
        let stream = dial_tcp(&self.cluster_id, addr, self.dial_timeout).await?;
        Ok(Box::new(stream))
    }

    async fn health(&self) -> ConnectorHealth {
        let state = if self.started.load(Ordering::SeqCst) {
            HealthState::Ok
        } else {
            HealthState::Stopped
        };
        ConnectorHealth::new(
            state,
            HealthDetails {
                cluster_id: self.cluster_id.clone(),
                ..Default::default()
            },
        )
    }

    async fn stop(&self) -> Result<(), ConnectorError> {
        if self.started.swap(false, Ordering::SeqCst) {
            debug!(cluster = %self.cluster_id, "Direct connector stopped");
        }
        Ok(())
    }

    fn state_dir(&self) -> Option<PathBuf> {
        None
    }
}
