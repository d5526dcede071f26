//! Header rewriting between the browser and upstream workloads
//!
//! Upstreams run as if they owned the origin root. Responses are adjusted so
//! they keep working inside an iframe under the proxy mount prefix:
//! redirects stay under the prefix, cookies are scoped to it and marked for
//! cross-site embedding, and framing/isolation headers are relaxed. Both the
//! cookie and the Location rewrite are idempotent.

use axum::http::header::{
    CONNECTION, CONTENT_SECURITY_POLICY, HOST, LOCATION, REFERRER_POLICY, SET_COOKIE,
    X_FRAME_OPTIONS,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use corridor_common::{FALLBACK_HOSTPORT_HEADER, FALLBACK_SCHEME_HEADER};
use tracing::debug;

/// Original Host seen by the proxy
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Scheme of the inbound connection
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Mount prefix the upstream is served under
pub const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

const COOP: &str = "cross-origin-opener-policy";
const COEP: &str = "cross-origin-embedder-policy";
const CORP: &str = "cross-origin-resource-policy";
const SERVICE_WORKER_ALLOWED: &str = "service-worker-allowed";
const FRAME_ANCESTORS: &str = "frame-ancestors 'self'";

/// Connection-scoped headers never forwarded (RFC 9110 §7.6.1)
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Build the upstream request headers from the inbound ones.
///
/// Drops Host and hop-by-hop headers (keeping `Connection`/`Upgrade` for
/// upgrades), drops any client-supplied fallback headers, and sets the
/// `X-Forwarded-*` trio.
pub fn upstream_headers(inbound: &HeaderMap, prefix: &str, tls: bool, upgrade: bool) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers, upgrade);
    headers.remove(HOST);
    headers.remove(FALLBACK_HOSTPORT_HEADER);
    headers.remove(FALLBACK_SCHEME_HEADER);

    if let Some(host) = inbound.get(HOST) {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
    let proto = if tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    match HeaderValue::from_str(prefix) {
        Ok(value) => {
            headers.insert(X_FORWARDED_PREFIX, value);
        }
        Err(_) => debug!(prefix, "Mount prefix is not a valid header value"),
    }
    headers
}

/// Remove hop-by-hop headers, including any named by `Connection`.
///
/// With `keep_upgrade`, `Connection` and `Upgrade` survive so the upstream
/// sees the handshake.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        if keep_upgrade && name == axum::http::header::UPGRADE {
            continue;
        }
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        if keep_upgrade && name == "connection" {
            continue;
        }
        headers.remove(name);
    }
    if !keep_upgrade {
        headers.remove(axum::http::header::UPGRADE);
    }
}

/// Adjust upstream response headers for display under `prefix`
pub fn rewrite_response_headers(headers: &mut HeaderMap, prefix: &str) {
    strip_hop_by_hop(headers, false);

    headers.remove(X_FRAME_OPTIONS);
    headers.remove(COEP);
    headers.insert(COOP, HeaderValue::from_static("same-origin-allow-popups"));
    headers.insert(CORP, HeaderValue::from_static("cross-origin"));

    let csp = headers
        .get(CONTENT_SECURITY_POLICY)
        .and_then(|v| v.to_str().ok())
        .map(relax_frame_ancestors)
        .unwrap_or_else(|| FRAME_ANCESTORS.to_string());
    set_str(headers, CONTENT_SECURITY_POLICY, &csp);

    let base = if prefix.is_empty() { "/" } else { prefix };
    set_str(headers, HeaderName::from_static(SERVICE_WORKER_ALLOWED), base);

    if !headers.contains_key(REFERRER_POLICY) {
        headers.insert(REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    }

    if let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
        let rewritten = rewrite_location(location, base);
        set_str(headers, LOCATION, &rewritten);
    }

    let cookies: Vec<HeaderValue> = headers.get_all(SET_COOKIE).iter().cloned().collect();
    if !cookies.is_empty() {
        headers.remove(SET_COOKIE);
        for cookie in cookies {
            let value = match cookie.to_str() {
                Ok(raw) => HeaderValue::from_str(&rewrite_set_cookie(raw, base)).unwrap_or(cookie),
                Err(_) => cookie,
            };
            headers.append(SET_COOKIE, value);
        }
    }
}

/// Keep a redirect under `base`.
///
/// Absolute and root-relative locations are re-rooted at `base`; relative
/// ones are joined to it. A location already under `base` is unchanged.
///
/// # Examples
///
/// ```
/// use corridor_proxy::rewrite::rewrite_location;
///
/// let base = "/proxy/server/ws1";
/// assert_eq!(rewrite_location("http://10.0.0.5:8080/login?next=/", base), "/proxy/server/ws1/login?next=/");
/// assert_eq!(rewrite_location("/login", base), "/proxy/server/ws1/login");
/// assert_eq!(rewrite_location("login", base), "/proxy/server/ws1/login");
/// assert_eq!(rewrite_location("/proxy/server/ws1/login", base), "/proxy/server/ws1/login");
/// ```
pub fn rewrite_location(location: &str, base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return location.to_string();
    }

    let path = if let Some(rest) = location.strip_prefix("//") {
        after_authority(rest)
    } else if let Some((scheme, rest)) = location.split_once("://") {
        if scheme.is_empty() || scheme.contains(['/', '?', '#']) {
            return format!("{}/{}", base, location);
        }
        after_authority(rest)
    } else if location.starts_with('/') {
        location
    } else {
        return format!("{}/{}", base, location);
    };

    if is_under(path, base) {
        path.to_string()
    } else {
        format!("{}{}", base, path)
    }
}

/// Scope a `Set-Cookie` value to `base` for a cross-site iframe.
///
/// Keeps name=value and unrelated attributes, drops `Domain`, and forces
/// `Path=<base>; Secure; SameSite=None; Partitioned`.
///
/// # Examples
///
/// ```
/// use corridor_proxy::rewrite::rewrite_set_cookie;
///
/// let once = rewrite_set_cookie("sid=abc; Domain=svc.local; Path=/; HttpOnly; SameSite=Lax", "/proxy/server/ws1");
/// assert_eq!(once, "sid=abc; HttpOnly; Path=/proxy/server/ws1; Secure; SameSite=None; Partitioned");
/// assert_eq!(rewrite_set_cookie(&once, "/proxy/server/ws1"), once);
/// ```
pub fn rewrite_set_cookie(cookie: &str, base: &str) -> String {
    let mut parts = cookie.split(';').map(str::trim).filter(|p| !p.is_empty());
    let Some(pair) = parts.next() else {
        return cookie.to_string();
    };
    let path = if base.is_empty() { "/" } else { base };

    let mut out: Vec<String> = vec![pair.to_string()];
    for attr in parts {
        let name = attr.split('=').next().unwrap_or("").trim().to_ascii_lowercase();
        if matches!(
            name.as_str(),
            "domain" | "path" | "samesite" | "secure" | "partitioned"
        ) {
            continue;
        }
        out.push(attr.to_string());
    }
    out.push(format!("Path={}", path));
    out.push("Secure".to_string());
    out.push("SameSite=None".to_string());
    out.push("Partitioned".to_string());
    out.join("; ")
}

/// Replace or add the CSP `frame-ancestors` directive so same-origin
/// framing is allowed; other directives are kept.
///
/// # Examples
///
/// ```
/// use corridor_proxy::rewrite::relax_frame_ancestors;
///
/// assert_eq!(
///     relax_frame_ancestors("default-src 'self'; frame-ancestors 'none'"),
///     "default-src 'self'; frame-ancestors 'self'"
/// );
/// assert_eq!(relax_frame_ancestors("img-src *"), "img-src *; frame-ancestors 'self'");
/// ```
pub fn relax_frame_ancestors(csp: &str) -> String {
    let mut found = false;
    let mut directives: Vec<&str> = csp
        .split(';')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| {
            if d.to_ascii_lowercase().starts_with("frame-ancestors") {
                found = true;
                FRAME_ANCESTORS
            } else {
                d
            }
        })
        .collect();
    if !found {
        directives.push(FRAME_ANCESTORS);
    }
    directives.join("; ")
}

/// Everything after `host[:port]` in `authority/rest`, or "" if nothing
fn after_authority(rest: &str) -> &str {
    match rest.find(['/', '?', '#']) {
        Some(i) => &rest[i..],
        None => "",
    }
}

fn is_under(path: &str, base: &str) -> bool {
    match path.strip_prefix(base) {
        Some(rest) => rest.is_empty() || rest.starts_with(['/', '?', '#']),
        None => false,
    }
}

fn set_str(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => debug!(header = %name, "Rewritten header value is not valid"),
    }
}
