//! Protocol upgrades (WebSocket) relayed as raw byte streams
//!
//! The upgrade handshake is forwarded to the upstream untouched. Once the
//! upstream answers 101, both connections are taken over from hyper and
//! bridged; frames are never parsed, so any upgrade protocol works.

use axum::body::Body;
use axum::http::header::{CONNECTION, UPGRADE};
use axum::http::{HeaderMap, Request, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corridor_cluster::bridge;

use crate::error::{ProxyError, Result};

/// Whether the request asks to switch protocols.
///
/// # Examples
///
/// ```
/// use axum::http::HeaderMap;
/// use corridor_proxy::upgrade::is_upgrade;
///
/// let mut headers = HeaderMap::new();
/// headers.insert("connection", "keep-alive, Upgrade".parse().unwrap());
/// headers.insert("upgrade", "websocket".parse().unwrap());
/// assert!(is_upgrade(&headers));
///
/// headers.remove("upgrade");
/// assert!(!is_upgrade(&headers));
/// ```
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(UPGRADE)
}

/// Take the inbound connection's upgrade handle.
///
/// Fails when the connection cannot be taken over (for example HTTP/2 or a
/// server without upgrade support).
pub fn take_inbound(request: &mut Request<Body>) -> Result<OnUpgrade> {
    request
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or_else(|| {
            ProxyError::StreamingUnsupported("connection does not support protocol upgrades".into())
        })
}

/// Answer the client with the upstream's 101 and bridge both connections in
/// the background until either side closes or `cancel` fires.
pub fn relay(
    inbound: OnUpgrade,
    mut upstream: Response<Body>,
    cancel: CancellationToken,
    target: String,
) -> Result<Response<Body>> {
    if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(ProxyError::Internal(format!(
            "upstream answered {} to an upgrade",
            upstream.status()
        )));
    }
    let upstream_upgrade = hyper::upgrade::on(&mut upstream);

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .body(Body::empty())
        .map_err(|e| ProxyError::Internal(format!("failed to build 101 response: {}", e)))?;
    *response.headers_mut() = upstream.headers().clone();

    tokio::spawn(async move {
        let (inbound, upstream) = match tokio::try_join!(inbound, upstream_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(%target, error = %e, "Upgrade handoff failed");
                return;
            }
        };
        debug!(%target, "Upgraded connection established");
        let stats = bridge(TokioIo::new(inbound), TokioIo::new(upstream), cancel).await;
        info!(
            %target,
            from_client = stats.a_to_b,
            from_upstream = stats.b_to_a,
            "Upgraded session ended"
        );
    });

    Ok(response)
}
