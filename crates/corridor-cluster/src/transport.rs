//! HTTP transports that dial through a cluster's connector
//!
//! Every client built here shares one dial hook, [`DialService`]: loopback
//! destinations go straight to the OS network stack (local port-forwards,
//! a local `kubectl proxy`), everything else goes through the cluster's
//! [`ClusterConnector`].
//!
//! Three clients per cluster:
//! - [`kube_client`]: the typed/dynamic Kubernetes client
//! - [`ApiTransport`]: raw HTTP/1.1 to the API server with cluster auth, for
//!   the pod/service proxy subresources
//! - [`WorkloadClient`]: raw HTTP/1.1 to workloads on the cluster network

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Request, Response, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::rt::{Read as _, Write as _};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use kube::client::ConfigExt;
use tower::buffer::Buffer;
use tower::util::BoxService;
use tower::{Service, ServiceBuilder, ServiceExt};

use crate::connector::{dial_tcp, BoxedIo, ClusterConnector};
use crate::error::ConnectorError;
use corridor_common::net::{is_loopback_host, join_host_port};

/// Boxed error used at the tower seams
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request body for raw transports; bodies are buffered before sending
pub type ProxyBody = Full<Bytes>;

/// Shared handle to a cluster's buffered API server service
pub type HttpService =
    Buffer<Request<ProxyBody>, BoxFuture<'static, Result<Response<Incoming>, BoxError>>>;

/// Requests queued per cluster API transport before callers wait
const API_BUFFER: usize = 1024;

/// Dial hook shared by every client of one cluster
#[derive(Clone)]
pub struct DialService {
    cluster_id: Arc<str>,
    connector: Arc<dyn ClusterConnector>,
    loopback_timeout: Duration,
}

impl DialService {
    /// Dial through `connector`; loopback dials are bounded by `loopback_timeout`
    pub fn new(
        cluster_id: &str,
        connector: Arc<dyn ClusterConnector>,
        loopback_timeout: Duration,
    ) -> Self {
        Self {
            cluster_id: Arc::from(cluster_id),
            connector,
            loopback_timeout,
        }
    }

    /// Open a connection to `host:port` using the loopback rule
    pub async fn dial(&self, host: &str, port: u16) -> Result<BoxedIo, ConnectorError> {
        let addr = join_host_port(host, port);
        if is_loopback_host(host) {
            let stream = dial_tcp(&self.cluster_id, &addr, self.loopback_timeout).await?;
            Ok(Box::new(stream))
        } else {
            self.connector.dial(&addr).await
        }
    }
}

impl Service<Uri> for DialService {
    type Response = ConnStream;
    type Error = ConnectorError;
    type Future = BoxFuture<'static, Result<ConnStream, ConnectorError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let host = uri.host().ok_or_else(|| {
                ConnectorError::no_route(this.cluster_id.as_ref(), uri.to_string(), "URI has no host")
            })?;
            let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
                Some("https") | Some("wss") => 443,
                _ => 80,
            });
            let io = this.dial(host, port).await?;
            Ok(ConnStream(TokioIo::new(io)))
        })
    }
}

/// Connection handed to hyper by [`DialService`]
pub struct ConnStream(TokioIo<BoxedIo>);

impl hyper::rt::Read for ConnStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for ConnStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl Connection for ConnStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Build a `kube::Client` whose connections go through `dial`
pub fn kube_client(config: &kube::Config, dial: DialService) -> Result<kube::Client, BoxError> {
    let https = config.rustls_https_connector_with_connector(dial)?;
    let client: Client<_, kube::client::Body> = Client::builder(TokioExecutor::new()).build(https);
    let service = ServiceBuilder::new()
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .map_err(BoxError::from)
        .service(client);
    Ok(kube::Client::new(service, config.default_namespace.clone()))
}

/// Raw HTTP/1.1 access to a cluster's API server.
///
/// Requests carry paths only; the base URL and cluster credentials are
/// applied here. Upgrades (101) pass through.
#[derive(Clone)]
pub struct ApiTransport {
    base: Uri,
    service: HttpService,
}

impl ApiTransport {
    /// Build from a cluster's client configuration
    pub fn new(config: &kube::Config, dial: DialService) -> Result<Self, BoxError> {
        let mut tls = config.rustls_client_config()?;
        tls.alpn_protocols = vec![b"http/1.1".to_vec()];
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(dial);
        let client: Client<_, ProxyBody> = Client::builder(TokioExecutor::new()).build(https);
        let service = ServiceBuilder::new()
            .option_layer(config.auth_layer()?)
            .map_err(BoxError::from)
            .service(client);
        Ok(Self {
            base: config.cluster_url.clone(),
            service: Buffer::new(BoxService::new(service), API_BUFFER),
        })
    }

    /// API server base URL
    pub fn base(&self) -> &Uri {
        &self.base
    }

    /// Send a path request to `base`, which may differ from the configured
    /// server, with the cluster's credentials applied
    pub fn send_to(
        &self,
        base: &Uri,
        mut request: Request<ProxyBody>,
    ) -> BoxFuture<'static, Result<Response<Incoming>, BoxError>> {
        match join_base(base, request.uri()) {
            Ok(uri) => {
                *request.uri_mut() = uri;
                Box::pin(self.service.clone().oneshot(request))
            }
            Err(e) => Box::pin(futures::future::ready(Err(e))),
        }
    }
}

/// Prefix `uri`'s path and query with `base`, keeping any base path.
fn join_base(base: &Uri, uri: &Uri) -> Result<Uri, BoxError> {
    let prefix = base.path().trim_end_matches('/');
    let pq = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut builder = Uri::builder().path_and_query(format!("{}{}", prefix, pq));
    if let Some(scheme) = base.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = base.authority() {
        builder = builder.authority(authority.clone());
    }
    Ok(builder.build()?)
}

/// Raw HTTP/1.1 client for workloads on the cluster network.
///
/// Workload certificates are cluster-internal and not verified.
#[derive(Clone)]
pub struct WorkloadClient {
    client: Client<hyper_rustls::HttpsConnector<DialService>, ProxyBody>,
}

impl WorkloadClient {
    /// Build a client over `dial`
    pub fn new(dial: DialService) -> Result<Self, BoxError> {
        let mut tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
        tls.alpn_protocols = vec![b"http/1.1".to_vec()];

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(dial);
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(https),
        })
    }

    /// Send a request with an absolute URI
    pub fn send(
        &self,
        request: Request<ProxyBody>,
    ) -> BoxFuture<'static, Result<Response<Incoming>, BoxError>> {
        let fut = self.client.request(request);
        Box::pin(async move { fut.await.map_err(BoxError::from) })
    }
}

/// Accepts any server certificate
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MockClusterConnector;
    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering `body` to the first request
    async fn spawn_http(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            let reply = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn loopback_dials_skip_the_connector() {
        let mut connector = MockClusterConnector::new();
        connector.expect_dial().times(0);
        let dial = DialService::new("c1", Arc::new(connector), Duration::from_secs(1));

        let port = spawn_http("direct").await;
        let client = WorkloadClient::new(dial).unwrap();
        let request = Request::get(format!("http://127.0.0.1:{}/", port))
            .body(ProxyBody::default())
            .unwrap();
        let response = client.send(request).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "direct");
    }

    #[tokio::test]
    async fn cluster_dials_use_the_connector() {
        let port = spawn_http("via-connector").await;
        let mut connector = MockClusterConnector::new();
        connector
            .expect_dial()
            .withf(|addr| addr == "10.96.0.10:8080")
            .times(1)
            .returning(move |_| {
                let std = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
                std.set_nonblocking(true).unwrap();
                let stream = tokio::net::TcpStream::from_std(std).unwrap();
                Ok(Box::new(stream) as BoxedIo)
            });
        let dial = DialService::new("c1", Arc::new(connector), Duration::from_secs(1));

        let client = WorkloadClient::new(dial).unwrap();
        let request = Request::get("http://10.96.0.10:8080/")
            .body(ProxyBody::default())
            .unwrap();
        let response = client.send(request).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "via-connector");
    }

    #[tokio::test]
    async fn api_requests_are_sent_to_the_given_base() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let mut connector = MockClusterConnector::new();
        connector.expect_dial().times(0);
        let dial = DialService::new("c1", Arc::new(connector), Duration::from_secs(1));

        let config = kube::Config::new("https://10.0.0.1:6443".parse().unwrap());
        let api = ApiTransport::new(&config, dial).unwrap();
        let port = spawn_http("via-proxy").await;
        let base: Uri = format!("http://127.0.0.1:{}", port).parse().unwrap();
        let request = Request::get("/api/v1/namespaces/default/services/ws1/proxy/")
            .body(ProxyBody::default())
            .unwrap();

        let response = api.send_to(&base, request).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "via-proxy");
    }

    #[test]
    fn join_base_keeps_base_path() {
        let base: Uri = "https://10.0.0.1:6443/k8s/".parse().unwrap();
        let uri: Uri = "/api/v1/namespaces?limit=1".parse().unwrap();
        assert_eq!(
            join_base(&base, &uri).unwrap().to_string(),
            "https://10.0.0.1:6443/k8s/api/v1/namespaces?limit=1"
        );
        let bare: Uri = "http://127.0.0.1:8001".parse().unwrap();
        assert_eq!(
            join_base(&bare, &uri).unwrap().to_string(),
            "http://127.0.0.1:8001/api/v1/namespaces?limit=1"
        );
    }

    #[tokio::test]
    async fn connector_errors_surface_from_dial() {
        let mut connector = MockClusterConnector::new();
        connector
            .expect_dial()
            .returning(|addr| Err(ConnectorError::no_route("c1", addr, "unreachable")));
        let dial = DialService::new("c1", Arc::new(connector), Duration::from_secs(1));
        let err = dial.dial("10.0.0.9", 80).await.err().unwrap();
        assert!(matches!(err, ConnectorError::NoRoute { .. }));
    }
}
