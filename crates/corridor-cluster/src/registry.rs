//! Per-cluster instance cache
//!
//! [`ClusterRegistry::get`] returns the ready [`ClusterInstance`] for a
//! cluster ID, constructing it on first use. Construction is single-flight:
//! concurrent callers for the same unseen ID share one construction. A failed
//! construction is not cached, so the next caller retries; until then the
//! entry lists as failed.
//!
//! [`ClusterRegistry::close`] marks the entry closing, waits for any
//! construction in flight, tears the instance down and only then forgets the
//! entry. Callers asking for a closing cluster get [`RegistryError::Closed`],
//! and a later `get` never builds alongside a teardown of the same state
//! directory.
//!
//! Construction order:
//! 1. Load the identity and build the client configuration
//! 2. Start the connector (overlay when credentials exist, else direct)
//! 3. Build the dial hook and the kube, API and workload clients over it
//! 4. Create the port-forward manager scoped to the cluster
//!
//! Nothing is shared between instances: each has its own connector, state
//! directory, clients and forward cache.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connector::{
    ClusterConnector, DirectConnector, HealthState, OverlayConnector, OverlaySettings, StateDir,
    StateRoot,
};
use crate::error::RegistryError;
use crate::portforward::{ForwardConfig, KubeTunnelDialer, PortForwardManager};
use crate::transport::{kube_client, ApiTransport, DialService, WorkloadClient};
use corridor_common::kubeconfig::{client_config, KubeTimeouts};
use corridor_common::{ClusterIdentity, ConfigError};

/// Default parent directory for overlay state
pub const DEFAULT_STATE_ROOT: &str = "/var/lib/corridor";

/// Default bound on connector dials
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Supplies cluster identities by ID
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentitySource: Send + Sync {
    /// Load the identity for `cluster_id`; unknown IDs are
    /// [`ConfigError::UnknownCluster`]
    async fn load(&self, cluster_id: &str) -> Result<ClusterIdentity, ConfigError>;
}

/// Process-wide settings applied to every instance
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Parent of per-cluster overlay state directories
    pub state_root: PathBuf,
    /// Overlay daemon settings
    pub overlay: OverlaySettings,
    /// Bound on each connector dial
    pub dial_timeout: Duration,
    /// Port-forward timeouts
    pub forward: ForwardConfig,
    /// Kubernetes client timeouts
    pub kube_timeouts: KubeTimeouts,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from(DEFAULT_STATE_ROOT),
            overlay: OverlaySettings::default(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            forward: ForwardConfig::default(),
            kube_timeouts: KubeTimeouts::default(),
        }
    }
}

/// Everything needed to talk to one cluster
pub struct ClusterInstance {
    /// Cluster ID
    pub id: String,
    /// Identity the instance was built from
    pub identity: ClusterIdentity,
    /// Client configuration with policy applied
    pub config: kube::Config,
    /// Kubernetes client over the cluster's dial hook
    pub client: kube::Client,
    /// Network route into the cluster
    pub connector: Arc<dyn ClusterConnector>,
    /// Dial hook shared by all clients
    pub dial: DialService,
    /// Raw API server transport for proxy subresources
    pub api: ApiTransport,
    /// Raw workload HTTP client
    pub workload: WorkloadClient,
    /// Port-forward cache
    pub forwards: PortForwardManager,
    /// Cancelled on teardown
    pub cancel: CancellationToken,
    /// When construction finished
    pub created_at: DateTime<Utc>,
    state_dir: Option<PathBuf>,
}

impl ClusterInstance {
    /// Namespace workloads live in
    pub fn namespace(&self) -> &str {
        self.identity.policy.namespace()
    }

    /// Overlay state directory, if any
    pub fn state_dir(&self) -> Option<&PathBuf> {
        self.state_dir.as_ref()
    }

    /// Stop background work and the connector; with `purge`, delete the
    /// overlay state directory. Idempotent.
    pub async fn shutdown(&self, purge: bool) {
        self.cancel.cancel();
        self.forwards.clear();
        if let Err(e) = self.connector.stop().await {
            warn!(cluster = %self.id, error = %e, "Connector stop failed");
        }
        if purge {
            if let Some(dir) = &self.state_dir {
                if let Err(e) = StateDir::existing(dir).purge() {
                    warn!(cluster = %self.id, path = %dir.display(), error = %e, "Failed to purge state directory");
                }
            }
        }
    }
}

/// Lifecycle of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstancePhase {
    /// Construction in flight
    Constructing,
    /// Ready for use
    Ready,
    /// Last construction failed; the next `get` retries
    Failed,
    /// Being torn down
    Closing,
}

/// Status record for one registry entry
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    /// Cluster ID
    pub id: String,
    /// Entry lifecycle
    pub phase: InstancePhase,
    /// Whether the connector reports anything but stopped
    pub started: bool,
    /// Overlay state directory, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<String>,
    /// Whether a Kubernetes client is built
    pub has_k8s: bool,
    /// Cached port-forward sessions
    pub forwards: usize,
    /// When the instance became ready
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Why the last construction failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClusterStatus {
    fn pending(id: String, phase: InstancePhase, error: Option<String>) -> Self {
        Self {
            id,
            phase,
            started: false,
            state_dir: None,
            has_k8s: false,
            forwards: 0,
            created_at: None,
            error,
        }
    }
}

/// One registry entry
#[derive(Default)]
struct Entry {
    instance: OnceCell<Arc<ClusterInstance>>,
    failure: Mutex<Option<String>>,
    closing: AtomicBool,
    teardown: OnceCell<bool>,
}

impl Entry {
    fn set_failure(&self, failure: Option<String>) {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = failure;
        }
    }

    fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Wait out any construction in flight, then shut the instance down
    /// once. Returns whether there was an instance to shut down.
    async fn retire(&self, cluster_id: &str, purge: bool) -> bool {
        self.closing.store(true, Ordering::SeqCst);
        *self
            .teardown
            .get_or_init(|| async {
                let built = self
                    .instance
                    .get_or_try_init(|| async {
                        Err(RegistryError::Closed(cluster_id.to_string()))
                    })
                    .await;
                match built {
                    Ok(instance) => {
                        instance.shutdown(purge).await;
                        true
                    }
                    Err(_) => false,
                }
            })
            .await
    }
}

type Slot = Arc<Entry>;

/// Factory and cache of [`ClusterInstance`]s keyed by cluster ID
pub struct ClusterRegistry {
    source: Arc<dyn IdentitySource>,
    settings: RegistrySettings,
    instances: DashMap<String, Slot>,
}

impl ClusterRegistry {
    /// Create an empty registry
    pub fn new(source: Arc<dyn IdentitySource>, settings: RegistrySettings) -> Self {
        Self {
            source,
            settings,
            instances: DashMap::new(),
        }
    }

    /// Return the instance for `cluster_id`, constructing it if needed
    #[instrument(skip(self))]
    pub async fn get(&self, cluster_id: &str) -> Result<Arc<ClusterInstance>, RegistryError> {
        let slot: Slot = self
            .instances
            .entry(cluster_id.to_string())
            .or_default()
            .clone();
        let closed = || RegistryError::Closed(cluster_id.to_string());
        if slot.is_closing() {
            return Err(closed());
        }

        let built = slot
            .instance
            .get_or_try_init(|| async {
                if slot.is_closing() {
                    return Err(closed());
                }
                slot.set_failure(None);
                self.construct(cluster_id).await
            })
            .await;
        match built {
            // The closer owns teardown of whatever was built
            _ if slot.is_closing() => Err(closed()),
            Ok(instance) => Ok(instance.clone()),
            Err(e) => {
                slot.set_failure(Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Tear down and forget `cluster_id`, deleting its overlay state.
    ///
    /// Waits for a construction in flight to finish first. The entry stays
    /// listed as closing until teardown is done, so run this in its own task
    /// when the caller may be cancelled. Returns whether an instance was
    /// torn down.
    #[instrument(skip(self))]
    pub async fn close(&self, cluster_id: &str) -> bool {
        let Some(slot) = self.instances.get(cluster_id).map(|e| e.value().clone()) else {
            return false;
        };
        let torn_down = slot.retire(cluster_id, true).await;
        self.instances
            .remove_if(cluster_id, |_, current| Arc::ptr_eq(current, &slot));
        if torn_down {
            info!(cluster = %cluster_id, "Cluster instance closed");
        } else {
            debug!(cluster = %cluster_id, "Closed cluster that never became ready");
        }
        torn_down
    }

    /// Status of every entry, sorted by ID
    pub async fn list(&self) -> Vec<ClusterStatus> {
        let entries: Vec<(String, Slot)> = self
            .instances
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut statuses = Vec::with_capacity(entries.len());
        for (id, slot) in entries {
            let status = match slot.instance.get() {
                _ if slot.is_closing() => ClusterStatus::pending(id, InstancePhase::Closing, None),
                Some(instance) => ClusterStatus {
                    started: instance.connector.health().await.state != HealthState::Stopped,
                    state_dir: instance.state_dir.as_ref().map(|d| d.display().to_string()),
                    phase: InstancePhase::Ready,
                    has_k8s: true,
                    forwards: instance.forwards.count(),
                    created_at: Some(instance.created_at),
                    error: None,
                    id,
                },
                None => match slot.failure() {
                    Some(error) => ClusterStatus::pending(id, InstancePhase::Failed, Some(error)),
                    None => ClusterStatus::pending(id, InstancePhase::Constructing, None),
                },
            };
            statuses.push(status);
        }
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Stop every instance without deleting state
    pub async fn shutdown_all(&self) {
        let slots: Vec<(String, Slot)> = self
            .instances
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (id, slot) in slots {
            slot.retire(&id, false).await;
            self.instances
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &slot));
        }
        info!("All cluster instances stopped");
    }

    async fn construct(&self, cluster_id: &str) -> Result<Arc<ClusterInstance>, RegistryError> {
        let identity = self.source.load(cluster_id).await?;
        let config = client_config(&identity, self.settings.kube_timeouts).await?;

        let root = StateRoot::new(&self.settings.state_root);
        let connector: Arc<dyn ClusterConnector> = match &identity.overlay {
            Some(credentials) => Arc::new(OverlayConnector::new(
                cluster_id,
                credentials,
                root.cluster_dir(cluster_id),
                OverlaySettings {
                    dial_timeout: self.settings.dial_timeout,
                    ..self.settings.overlay.clone()
                },
            )),
            None => Arc::new(DirectConnector::new(cluster_id, self.settings.dial_timeout)),
        };
        connector.start().await?;

        match self.build(cluster_id, identity, config, connector.clone()) {
            Ok(instance) => {
                info!(cluster = %cluster_id, overlay = instance.state_dir.is_some(), "Cluster instance ready");
                Ok(Arc::new(instance))
            }
            Err(e) => {
                if let Err(stop) = connector.stop().await {
                    warn!(cluster = %cluster_id, error = %stop, "Connector stop failed after build error");
                }
                Err(e)
            }
        }
    }

    fn build(
        &self,
        cluster_id: &str,
        identity: ClusterIdentity,
        config: kube::Config,
        connector: Arc<dyn ClusterConnector>,
    ) -> Result<ClusterInstance, RegistryError> {
        let client_error = |e: crate::transport::BoxError| RegistryError::client(cluster_id, e.to_string());

        let dial = DialService::new(cluster_id, connector.clone(), self.settings.dial_timeout);
        let client = kube_client(&config, dial.clone()).map_err(client_error)?;
        let api = ApiTransport::new(&config, dial.clone()).map_err(client_error)?;
        let workload = WorkloadClient::new(dial.clone()).map_err(client_error)?;

        let cancel = CancellationToken::new();
        let forwards = PortForwardManager::new(
            cluster_id,
            Arc::new(KubeTunnelDialer::new(client.clone())),
            self.settings.forward,
            &cancel,
        );

        Ok(ClusterInstance {
            id: cluster_id.to_string(),
            state_dir: connector.state_dir(),
            identity,
            config,
            client,
            connector,
            dial,
            api,
            workload,
            forwards,
            cancel,
            created_at: Utc::now(),
        })
    }
}
