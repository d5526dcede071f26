//! Host, port and scheme helpers
//!
//! Single place for the small address rules every layer agrees on: what
//! counts as loopback, how `host:port` splits, and which scheme a port
//! implies.

use std::net::IpAddr;

use http::uri::{Scheme, Uri};

/// Ports that imply TLS when no scheme is given
pub const TLS_PORTS: [u16; 2] = [443, 8443];

/// Default workload port when nothing better is known
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Whether a host (name or IP, optionally bracketed) is the local machine.
///
/// # Examples
///
/// ```
/// use corridor_common::net::is_loopback_host;
///
/// assert!(is_loopback_host("127.0.0.1"));
/// assert!(is_loopback_host("[::1]"));
/// assert!(is_loopback_host("LOCALHOST"));
/// assert!(!is_loopback_host("10.0.0.1"));
/// ```
pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Whether a `host:port` string points at the local machine
pub fn is_loopback_hostport(hostport: &str) -> bool {
    match split_host_port(hostport) {
        Some((host, _)) => is_loopback_host(host),
        None => is_loopback_host(hostport),
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts.
///
/// Returns None when the port is missing, not numeric, or zero.
///
/// # Examples
///
/// ```
/// use corridor_common::net::split_host_port;
///
/// assert_eq!(split_host_port("svc:8080"), Some(("svc", 8080)));
/// assert_eq!(split_host_port("[::1]:443"), Some(("[::1]", 443)));
/// assert_eq!(split_host_port("svc"), None);
/// assert_eq!(split_host_port("svc:0"), None);
/// ```
pub fn split_host_port(hostport: &str) -> Option<(&str, u16)> {
    let (host, port) = hostport.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    // A bare IPv6 address without brackets has more colons than a port split
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    Some((host, port))
}

/// Scheme implied by a port: https for 443/8443, http otherwise
pub fn scheme_for_port(port: u16) -> &'static str {
    if TLS_PORTS.contains(&port) {
        "https"
    } else {
        "http"
    }
}

/// Join host and port, bracketing bare IPv6 hosts
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Return `uri` with its scheme replaced by plain http
pub fn force_http(uri: &Uri) -> Result<Uri, http::Error> {
    let mut parts = uri.clone().into_parts();
    parts.scheme = Some(Scheme::HTTP);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
    }
    Ok(Uri::from_parts(parts)?)
}

/// Whether a URI's host is loopback
pub fn uri_is_loopback(uri: &Uri) -> bool {
    uri.host().map(is_loopback_host).unwrap_or(false)
}
