//! Local TCP port-forwards to pod ports
//!
//! [`PortForwardManager::ensure`] hands out a `127.0.0.1` port that relays to
//! a pod port through the API server's `pods/portforward` subresource.
//!
//! Each session:
//! - binds an OS-assigned loopback port
//! - opens one tunnel up front; the first successful tunnel is the ready signal
//! - serves each accepted connection over its own tunnel (the warm one first)
//! - treats a connection that closes without sending data as a liveness check
//!
//! Sessions are checked with a quick TCP connect on every reuse and replaced
//! when the check fails. Nothing evicts idle sessions in the background.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::BoxedIo;
use crate::error::ForwardError;
use crate::relay::bridge;

/// Default bound on a session becoming ready
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(8);

/// Default bound on the reuse check
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_millis(300);

/// Identifies one forward
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardKey {
    /// Owning cluster
    pub cluster: String,
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container port
    pub port: u16,
}

/// One upgraded connection to a pod port
pub struct PodTunnel {
    /// Byte stream to the pod port
    pub stream: BoxedIo,
    /// Run after the stream is finished with, to reap the tunnel
    pub closer: Option<BoxFuture<'static, ()>>,
}

/// Opens tunnels to pod ports
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    /// Open a new tunnel to `namespace/pod:port`
    async fn open(&self, namespace: &str, pod: &str, port: u16) -> Result<PodTunnel, ForwardError>;
}

/// Tunnels over the API server's WebSocket portforward subresource
pub struct KubeTunnelDialer {
    client: kube::Client,
}

impl KubeTunnelDialer {
    /// Use `client` for portforward requests
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TunnelDialer for KubeTunnelDialer {
    async fn open(&self, namespace: &str, pod: &str, port: u16) -> Result<PodTunnel, ForwardError> {
        let tunnel_error = |message: String| ForwardError::Tunnel {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            port,
            message,
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut forwarder = pods
            .portforward(pod, &[port])
            .await
            .map_err(|e| tunnel_error(e.to_string()))?;
        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| tunnel_error(format!("no stream for port {}", port)))?;

        let label = format!("{}/{}:{}", namespace, pod, port);
        let closer = async move {
            if let Err(e) = forwarder.join().await {
                debug!(target_pod = %label, error = %e, "Port-forward tunnel ended with error");
            }
        }
        .boxed();

        Ok(PodTunnel {
            stream: Box::new(stream),
            closer: Some(closer),
        })
    }
}

/// Timeouts for port-forward sessions
#[derive(Debug, Clone, Copy)]
pub struct ForwardConfig {
    /// Bound on a new session becoming ready
    pub start_timeout: Duration,
    /// Bound on the reuse check
    pub check_timeout: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            start_timeout: DEFAULT_START_TIMEOUT,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }
}

/// A live forward; stops serving when dropped
struct ForwardSession {
    local_port: u16,
    cancel: CancellationToken,
}

impl Drop for ForwardSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Per-cluster cache of port-forward sessions
pub struct PortForwardManager {
    cluster_id: String,
    dialer: Arc<dyn TunnelDialer>,
    config: ForwardConfig,
    cancel: CancellationToken,
    sessions: DashMap<ForwardKey, Arc<ForwardSession>>,
    construct_locks: DashMap<ForwardKey, Arc<Mutex<()>>>,
}

impl PortForwardManager {
    /// Create a manager for `cluster_id`. Cancelling `parent` stops every
    /// session.
    pub fn new(
        cluster_id: impl Into<String>,
        dialer: Arc<dyn TunnelDialer>,
        config: ForwardConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            dialer,
            config,
            cancel: parent.child_token(),
            sessions: DashMap::new(),
            construct_locks: DashMap::new(),
        }
    }

    /// Return a local port relaying to `namespace/pod:port`, starting a
    /// session if no healthy one exists
    pub async fn ensure(&self, namespace: &str, pod: &str, port: u16) -> Result<u16, ForwardError> {
        let key = ForwardKey {
            cluster: self.cluster_id.clone(),
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            port,
        };

        if let Some(local) = self.healthy_port(&key).await {
            return Ok(local);
        }

        let lock = self.construct_locks.entry(key.clone()).or_default().clone();
        let started = {
            let _guard = lock.lock().await;
            self.start_session(&key).await
        };
        drop(lock);
        self.construct_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        started
    }

    async fn start_session(&self, key: &ForwardKey) -> Result<u16, ForwardError> {
        let (namespace, pod, port) = (key.namespace.as_str(), key.pod.as_str(), key.port);
        if let Some(local) = self.healthy_port(key).await {
            return Ok(local);
        }
        let stale = self.sessions.remove(key).map(|(_, s)| s.local_port);
        if let Some(stale) = stale {
            debug!(cluster = %self.cluster_id, namespace, pod, port, stale, "Replacing stale port-forward");
        }

        let listener = bind_loopback(stale).await.map_err(ForwardError::Bind)?;
        let local_port = listener.local_addr().map_err(ForwardError::Bind)?.port();

        let cancel = self.cancel.child_token();
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(run_session(
            listener,
            self.dialer.clone(),
            key.clone(),
            cancel.clone(),
            ready_tx,
        ));

        let failed = |e: ForwardError| -> Result<u16, ForwardError> {
            cancel.cancel();
            Err(e)
        };
        match tokio::time::timeout(self.config.start_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return failed(e),
            Ok(Err(_)) => {
                return failed(ForwardError::Tunnel {
                    namespace: namespace.to_string(),
                    pod: pod.to_string(),
                    port,
                    message: "session ended before it was ready".to_string(),
                })
            }
            Err(_) => {
                return failed(ForwardError::ForwardStartTimeout {
                    namespace: namespace.to_string(),
                    pod: pod.to_string(),
                    port,
                    timeout: self.config.start_timeout,
                })
            }
        }

        info!(cluster = %self.cluster_id, namespace, pod, port, local_port, "Port-forward ready");
        self.sessions
            .insert(key.clone(), Arc::new(ForwardSession { local_port, cancel }));
        Ok(local_port)
    }

    /// Number of cached sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Stop and drop every session
    pub fn clear(&self) {
        self.sessions.clear();
        self.construct_locks.clear();
    }

    async fn healthy_port(&self, key: &ForwardKey) -> Option<u16> {
        let session = self.sessions.get(key).map(|s| s.value().clone())?;
        if session.cancel.is_cancelled() {
            return None;
        }
        accepts_connections(session.local_port, self.config.check_timeout)
            .await
            .then_some(session.local_port)
    }
}

async fn accepts_connections(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Bind an OS-assigned loopback port, avoiding `avoid` once
async fn bind_loopback(avoid: Option<u16>) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    if avoid.is_some() && avoid == Some(listener.local_addr()?.port()) {
        drop(listener);
        return TcpListener::bind("127.0.0.1:0").await;
    }
    Ok(listener)
}

async fn run_session(
    listener: TcpListener,
    dialer: Arc<dyn TunnelDialer>,
    key: ForwardKey,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<(), ForwardError>>,
) {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        result = dialer.open(&key.namespace, &key.pod, key.port) => result,
    };
    let warm = match opened {
        Ok(tunnel) => tunnel,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }
    let warm = Arc::new(Mutex::new(Some(warm)));

    loop {
        let socket = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, _)) => socket,
                Err(e) => {
                    warn!(cluster = %key.cluster, pod = %key.pod, error = %e, "Port-forward accept failed");
                    break;
                }
            },
        };
        tokio::spawn(serve_connection(
            socket,
            dialer.clone(),
            key.clone(),
            warm.clone(),
            cancel.clone(),
        ));
    }
    debug!(cluster = %key.cluster, pod = %key.pod, port = key.port, "Port-forward session stopped");
}

async fn serve_connection(
    socket: TcpStream,
    dialer: Arc<dyn TunnelDialer>,
    key: ForwardKey,
    warm: Arc<Mutex<Option<PodTunnel>>>,
    cancel: CancellationToken,
) {
    let mut first = [0u8; 1];
    let peeked = tokio::select! {
        _ = cancel.cancelled() => return,
        peeked = socket.peek(&mut first) => peeked,
    };
    // Liveness checks connect and close without sending anything
    if !matches!(peeked, Ok(n) if n > 0) {
        return;
    }

    let cached = warm.lock().await.take();
    let tunnel = match cached {
        Some(tunnel) => tunnel,
        None => match dialer.open(&key.namespace, &key.pod, key.port).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!(cluster = %key.cluster, pod = %key.pod, port = key.port, error = %e, "Port-forward tunnel failed");
                // Reset rather than close so the client sees a failed dial
                let _ = socket.set_linger(Some(Duration::ZERO));
                return;
            }
        },
    };

    let stats = bridge(socket, tunnel.stream, cancel).await;
    debug!(
        pod = %key.pod,
        port = key.port,
        sent = stats.a_to_b,
        received = stats.b_to_a,
        "Port-forward connection closed"
    );
    if let Some(closer) = tunnel.closer {
        closer.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    /// Tunnel whose far end echoes everything back
    fn echo_tunnel() -> PodTunnel {
        let (near, far) = duplex(1024);
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        PodTunnel {
            stream: Box::new(near),
            closer: None,
        }
    }

    fn echo_dialer(opens: Arc<AtomicUsize>) -> MockTunnelDialer {
        let mut dialer = MockTunnelDialer::new();
        dialer.expect_open().returning(move |_, _, _| {
            opens.fetch_add(1, Ordering::SeqCst);
            Ok(echo_tunnel())
        });
        dialer
    }

    fn manager(cluster: &str, dialer: Arc<dyn TunnelDialer>) -> PortForwardManager {
        PortForwardManager::new(cluster, dialer, ForwardConfig::default(), &CancellationToken::new())
    }

    /// Never signals ready
    struct StalledDialer;

    #[async_trait]
    impl TunnelDialer for StalledDialer {
        async fn open(&self, _: &str, _: &str, _: u16) -> Result<PodTunnel, ForwardError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn healthy_session_is_reused() {
        let opens = Arc::new(AtomicUsize::new(0));
        let pf = manager("c1", Arc::new(echo_dialer(opens.clone())));
        let first = pf.ensure("default", "p1", 8080).await.unwrap();
        let second = pf.ensure("default", "p1", 8080).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(pf.count(), 1);
        // Reuse checks never open tunnels
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn relays_bytes_to_the_pod() {
        let pf = manager("c1", Arc::new(echo_dialer(Arc::new(AtomicUsize::new(0)))));
        let port = pf.ensure("default", "p1", 8080).await.unwrap();

        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn terminated_session_is_replaced_with_new_port() {
        let pf = manager("c1", Arc::new(echo_dialer(Arc::new(AtomicUsize::new(0)))));
        let first = pf.ensure("default", "p1", 8080).await.unwrap();

        let key = ForwardKey {
            cluster: "c1".into(),
            namespace: "default".into(),
            pod: "p1".into(),
            port: 8080,
        };
        pf.sessions.get(&key).unwrap().cancel.cancel();

        let second = pf.ensure("default", "p1", 8080).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(pf.count(), 1);
    }

    #[tokio::test]
    async fn never_ready_times_out_without_caching() {
        let pf = PortForwardManager::new(
            "c1",
            Arc::new(StalledDialer),
            ForwardConfig {
                start_timeout: Duration::from_millis(50),
                check_timeout: DEFAULT_CHECK_TIMEOUT,
            },
            &CancellationToken::new(),
        );
        let err = pf.ensure("default", "p1", 8080).await.unwrap_err();
        assert!(matches!(err, ForwardError::ForwardStartTimeout { port: 8080, .. }));
        assert_eq!(pf.count(), 0);
    }

    #[tokio::test]
    async fn tunnel_errors_surface_and_are_not_cached() {
        let mut dialer = MockTunnelDialer::new();
        dialer.expect_open().times(2).returning(|ns, pod, port| {
            Err(ForwardError::Tunnel {
                namespace: ns.to_string(),
                pod: pod.to_string(),
                port,
                message: "pods \"p1\" not found".into(),
            })
        });
        let pf = manager("c1", Arc::new(dialer));
        assert!(matches!(
            pf.ensure("default", "p1", 8080).await,
            Err(ForwardError::Tunnel { .. })
        ));
        assert!(pf.ensure("default", "p1", 8080).await.is_err());
        assert_eq!(pf.count(), 0);
        assert!(pf.construct_locks.is_empty());
    }

    #[tokio::test]
    async fn concurrent_first_calls_share_one_session() {
        let opens = Arc::new(AtomicUsize::new(0));
        let pf = Arc::new(manager("c1", Arc::new(echo_dialer(opens.clone()))));
        let calls = (0..8).map(|_| {
            let pf = pf.clone();
            tokio::spawn(async move { pf.ensure("default", "p1", 8080).await.unwrap() })
        });
        let ports: Vec<u16> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert!(ports.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(pf.construct_locks.is_empty());
    }

    #[tokio::test]
    async fn failed_tunnel_resets_the_client_connection() {
        let opens = Arc::new(AtomicUsize::new(0));
        let mut dialer = MockTunnelDialer::new();
        let counter = opens.clone();
        dialer.expect_open().returning(move |ns, pod, port| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(echo_tunnel());
            }
            Err(ForwardError::Tunnel {
                namespace: ns.to_string(),
                pod: pod.to_string(),
                port,
                message: "pod is gone".into(),
            })
        });
        let pf = manager("c1", Arc::new(dialer));
        let port = pf.ensure("default", "p1", 8080).await.unwrap();

        // The first connection takes the tunnel opened at start-up
        let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        first.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        first.read_exact(&mut buf).await.unwrap();

        let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        second.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap();
        match read {
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
            Ok(n) => panic!("expected a reset, read {} bytes", n),
        }
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clusters_do_not_share_sessions() {
        let a = manager("a", Arc::new(echo_dialer(Arc::new(AtomicUsize::new(0)))));
        let b = manager("b", Arc::new(echo_dialer(Arc::new(AtomicUsize::new(0)))));
        let pa = a.ensure("default", "p1", 8080).await.unwrap();
        let pb = b.ensure("default", "p1", 8080).await.unwrap();
        assert_ne!(pa, pb);
    }

    #[tokio::test]
    async fn clear_stops_everything() {
        let pf = manager("c1", Arc::new(echo_dialer(Arc::new(AtomicUsize::new(0)))));
        pf.ensure("default", "p1", 8080).await.unwrap();
        pf.ensure("default", "p2", 8080).await.unwrap();
        assert_eq!(pf.count(), 2);
        pf.clear();
        assert_eq!(pf.count(), 0);
    }
}
