//! Ordered transport attempts with one bounded fallback hop
//!
//! A [`Plan`] is a primary [`Attempt`] plus at most one fallback. Each attempt
//! names the strategy that produced it and how it travels ([`Via`]). The
//! engine walks the plan with [`dispatch`]: an attempt that returns a
//! response has handled the request; an attempt whose dial fails hands over
//! to the next one; any other failure is surfaced immediately.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, Uri};
use tracing::{debug, warn};

use corridor_cluster::{BoxError, ConnectorError, ProxyBody};
use corridor_common::{FALLBACK_HOSTPORT_HEADER, FALLBACK_SCHEME_HEADER};

use crate::error::{ProxyError, Result};

/// How a request reaches its upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Local port-forward to a pod
    PortForward,
    /// API server `pods/{pod}/proxy` subresource
    PodProxy,
    /// API server `services/{svc}/proxy` subresource
    ServiceProxy,
    /// Dial the address through the cluster connector
    DirectDial,
}

impl Strategy {
    /// Short label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::PortForward => "port-forward",
            Strategy::PodProxy => "pod-proxy",
            Strategy::ServiceProxy => "service-proxy",
            Strategy::DirectDial => "direct-dial",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which client carries an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Via {
    /// Workload client; the URI is absolute
    Workload,
    /// API server transport; the URI is a path joined onto `base`
    ApiServer {
        /// API server base URL
        base: Uri,
    },
}

/// One way to reach the upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// Strategy that produced this attempt
    pub strategy: Strategy,
    /// Client that carries it
    pub via: Via,
    /// Absolute URI for [`Via::Workload`], path and query for [`Via::ApiServer`]
    pub uri: Uri,
}

impl Attempt {
    /// Attempt sent straight to `scheme://hostport{path_and_query}`
    pub fn direct(
        strategy: Strategy,
        scheme: &str,
        hostport: &str,
        path_and_query: &str,
    ) -> Result<Self> {
        let uri = format!("{}://{}{}", scheme, hostport, path_and_query)
            .parse()
            .map_err(|e| ProxyError::BadTarget(format!("invalid upstream {}: {}", hostport, e)))?;
        Ok(Self {
            strategy,
            via: Via::Workload,
            uri,
        })
    }

    /// Attempt sent to `path` on the API server at `base`
    pub fn api(strategy: Strategy, base: Uri, path: &str) -> Result<Self> {
        let uri = path
            .parse()
            .map_err(|e| ProxyError::BadTarget(format!("invalid API path {}: {}", path, e)))?;
        Ok(Self {
            strategy,
            via: Via::ApiServer { base },
            uri,
        })
    }

    /// Where this attempt goes, for logs and errors
    pub fn target(&self) -> String {
        match &self.via {
            Via::Workload => self.uri.to_string(),
            Via::ApiServer { base } => {
                format!("{}{}", base.to_string().trim_end_matches('/'), self.uri)
            }
        }
    }
}

/// Primary attempt and at most one fallback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    attempts: Vec<Attempt>,
}

impl Plan {
    /// Plan with only `primary`
    pub fn new(primary: Attempt) -> Self {
        Self {
            attempts: vec![primary],
        }
    }

    /// Set the fallback, replacing any earlier one
    pub fn with_fallback(mut self, fallback: Attempt) -> Self {
        self.attempts.truncate(1);
        self.attempts.push(fallback);
        self
    }

    /// Attempts in order
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    /// The first attempt
    pub fn primary(&self) -> &Attempt {
        &self.attempts[0]
    }
}

/// Request parts replayed for each attempt
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Method
    pub method: Method,
    /// Headers, already prepared for the upstream
    pub headers: HeaderMap,
    /// Buffered body
    pub body: Bytes,
}

impl Outbound {
    fn request(&self, uri: Uri) -> Result<Request<ProxyBody>> {
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(uri)
            .body(ProxyBody::new(self.body.clone()))
            .map_err(|e| ProxyError::Internal(format!("failed to build upstream request: {}", e)))?;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}

/// Sends one attempt's request
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `request` through `via`
    async fn send(
        &self,
        via: &Via,
        request: Request<ProxyBody>,
    ) -> std::result::Result<Response<Body>, BoxError>;
}

/// Turn the fallback headers stashed by a rewrite into a direct-dial
/// attempt, removing them from `headers`
pub fn take_fallback(headers: &mut HeaderMap, path_and_query: &str) -> Option<Attempt> {
    let hostport = headers.remove(FALLBACK_HOSTPORT_HEADER)?;
    let scheme = headers.remove(FALLBACK_SCHEME_HEADER);
    let hostport = hostport.to_str().ok()?;
    let scheme = scheme
        .as_ref()
        .and_then(|s| s.to_str().ok())
        .filter(|s| matches!(*s, "http" | "https"))
        .unwrap_or("http");
    Attempt::direct(Strategy::DirectDial, scheme, hostport, path_and_query).ok()
}

/// Whether an upstream error happened before any response came back.
///
/// A port-forward listener accepts the connection before it knows whether
/// the pod tunnel opens, so a reset or a connection closed before the
/// response head counts the same as a refused dial.
pub fn is_dial_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.downcast_ref::<ConnectorError>().is_some() {
            return true;
        }
        if let Some(client) = e.downcast_ref::<hyper_util::client::legacy::Error>() {
            if client.is_connect() {
                return true;
            }
        }
        if let Some(hyper) = e.downcast_ref::<hyper::Error>() {
            if hyper.is_incomplete_message() {
                return true;
            }
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Walk `plan` until an attempt handles the request
pub async fn dispatch(
    upstream: &dyn Upstream,
    plan: &Plan,
    outbound: &Outbound,
    timeout: Duration,
) -> Result<Response<Body>> {
    let attempts = plan.attempts();
    for (hop, attempt) in attempts.iter().enumerate() {
        let request = outbound.request(attempt.uri.clone())?;
        let sent = tokio::time::timeout(timeout, upstream.send(&attempt.via, request)).await;
        match sent {
            Ok(Ok(response)) => {
                debug!(
                    strategy = %attempt.strategy,
                    status = response.status().as_u16(),
                    hop,
                    "Upstream responded"
                );
                return Ok(response);
            }
            Ok(Err(e)) if hop + 1 < attempts.len() && is_dial_failure(e.as_ref()) => {
                warn!(
                    strategy = %attempt.strategy,
                    target = %attempt.target(),
                    fallback = %attempts[hop + 1].strategy,
                    error = %e,
                    "Dial failed, trying fallback"
                );
            }
            Ok(Err(e)) => return Err(ProxyError::unreachable(attempt.target(), e)),
            Err(_) => {
                return Err(ProxyError::unreachable(
                    attempt.target(),
                    format!("no response within {:?}", timeout),
                ))
            }
        }
    }
    Err(ProxyError::Internal("empty upstream plan".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use std::sync::Arc;

    fn outbound() -> Outbound {
        Outbound {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn ok() -> Response<Body> {
        Response::builder()
            .status(StatusCode::OK)
            .body(Body::from("ok"))
            .unwrap()
    }

    fn dial_error() -> BoxError {
        Box::new(ConnectorError::no_route("c1", "127.0.0.1:36001", "refused"))
    }

    fn forward_plan() -> Plan {
        Plan::new(Attempt::direct(Strategy::PortForward, "http", "127.0.0.1:36001", "/").unwrap())
            .with_fallback(Attempt::direct(Strategy::DirectDial, "http", "10.96.0.12:8080", "/").unwrap())
    }

    #[tokio::test]
    async fn dial_failure_takes_exactly_one_fallback_hop() {
        let mut upstream = MockUpstream::new();
        let mut seq = mockall::Sequence::new();
        upstream
            .expect_send()
            .withf(|via, req| *via == Via::Workload && req.uri().port_u16() == Some(36001))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(dial_error()));
        upstream
            .expect_send()
            .withf(|_, req| req.uri().host() == Some("10.96.0.12"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(ok()));

        let response = dispatch(&upstream, &forward_plan(), &outbound(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn failing_fallback_is_surfaced_not_retried() {
        let mut upstream = MockUpstream::new();
        upstream
            .expect_send()
            .times(2)
            .returning(|_, _| Err(dial_error()));

        let err = dispatch(&upstream, &forward_plan(), &outbound(), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            ProxyError::UpstreamUnreachable { target, .. } => assert!(target.contains("10.96.0.12")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_dial_errors_skip_the_fallback() {
        let mut upstream = MockUpstream::new();
        upstream
            .expect_send()
            .times(1)
            .returning(|_, _| Err("connection reset mid-response".into()));

        let err = dispatch(&upstream, &forward_plan(), &outbound(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnreachable { .. }));
    }

    /// Listener that accepts every connection and drops it unanswered
    async fn accept_and_drop() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });
        addr
    }

    #[tokio::test]
    async fn connection_dropped_before_response_is_a_dial_failure() {
        use hyper_util::client::legacy::Client;
        use hyper_util::rt::TokioExecutor;

        let addr = accept_and_drop().await;
        let client = Client::builder(TokioExecutor::new()).build_http::<ProxyBody>();
        let uri: Uri = format!("http://{}/", addr).parse().unwrap();
        let err = client
            .request(Request::get(uri).body(ProxyBody::new(Bytes::new())).unwrap())
            .await
            .unwrap_err();
        assert!(!err.is_connect());
        assert!(is_dial_failure(&err), "{:?}", err);
    }

    #[test]
    fn reset_connections_are_dial_failures() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(is_dial_failure(&reset));
        let timed_out = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert!(!is_dial_failure(&timed_out));
    }

    #[tokio::test]
    async fn error_responses_are_handled_not_retried() {
        let mut upstream = MockUpstream::new();
        upstream.expect_send().times(1).returning(|_, _| {
            Ok(Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(Body::empty())
                .unwrap())
        });
        let response = dispatch(&upstream, &forward_plan(), &outbound(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    struct Stalled;

    #[async_trait]
    impl Upstream for Stalled {
        async fn send(
            &self,
            _via: &Via,
            _request: Request<ProxyBody>,
        ) -> std::result::Result<Response<Body>, BoxError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ok())
        }
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let plan = Plan::new(Attempt::direct(Strategy::DirectDial, "http", "10.0.0.1:80", "/").unwrap());
        let upstream: Arc<dyn Upstream> = Arc::new(Stalled);
        let err = dispatch(upstream.as_ref(), &plan, &outbound(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no response within"));
    }

    #[test]
    fn plan_keeps_at_most_one_fallback() {
        let plan = forward_plan()
            .with_fallback(Attempt::direct(Strategy::DirectDial, "https", "10.96.0.13:443", "/").unwrap());
        assert_eq!(plan.attempts().len(), 2);
        assert_eq!(plan.primary().strategy, Strategy::PortForward);
        assert_eq!(plan.attempts()[1].uri.to_string(), "https://10.96.0.13:443/");
    }

    #[test]
    fn fallback_headers_become_a_direct_attempt() {
        let mut headers = HeaderMap::new();
        headers.insert(FALLBACK_HOSTPORT_HEADER, "10.96.0.12:8443".parse().unwrap());
        headers.insert(FALLBACK_SCHEME_HEADER, "https".parse().unwrap());
        headers.insert("accept", "*/*".parse().unwrap());

        let attempt = take_fallback(&mut headers, "/term?x=1").unwrap();
        assert_eq!(attempt.strategy, Strategy::DirectDial);
        assert_eq!(attempt.uri.to_string(), "https://10.96.0.12:8443/term?x=1");
        assert!(!headers.contains_key(FALLBACK_HOSTPORT_HEADER));
        assert!(!headers.contains_key(FALLBACK_SCHEME_HEADER));
        assert_eq!(headers.len(), 1);
        assert!(take_fallback(&mut headers, "/").is_none());
    }

    #[test]
    fn api_attempt_target_joins_base() {
        let attempt = Attempt::api(
            Strategy::ServiceProxy,
            "https://10.0.0.1:6443".parse().unwrap(),
            "/api/v1/namespaces/default/services/http:ws1:8080/proxy/",
        )
        .unwrap();
        assert_eq!(
            attempt.target(),
            "https://10.0.0.1:6443/api/v1/namespaces/default/services/http:ws1:8080/proxy/"
        );
    }

    #[test]
    fn dial_failures_are_found_in_the_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(is_dial_failure(&io));
        assert!(is_dial_failure(dial_error().as_ref()));
        let other: BoxError = "protocol error".into();
        assert!(!is_dial_failure(other.as_ref()));
    }
}
