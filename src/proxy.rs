//! Reverse proxy for mappings that point at remote origins
//!
//! Requests are forwarded with the inbound method. Headers are copied except
//! for `Host` (rewritten to the target) and hop-by-hop headers, including any
//! named in the inbound `Connection` header. `Max-Forwards` is decremented on
//! every hop and a request that arrives with no hops left is refused, so two
//! sites mapped onto each other cannot loop forever.

use crate::error::{json_error_response, HostingErrorCode};
use crate::pool::{ConnectionPool, PoolError};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderName, HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, DATE, HOST, MAX_FORWARDS,
    PRAGMA, SERVER, VIA,
};
use hyper::{HeaderMap, Method, Request, Response, Uri};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Value appended to `Via` on both legs
pub const VIA_MARKER: &str = "1.1 sitehost";

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that describe a single connection and never cross the proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Errors raised while forwarding a request
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Max-Forwards exceeded")]
    ForwardingLoop,

    #[error("Unsupported target URL {0}, only http:// origins can be proxied")]
    UnsupportedTarget(String),

    #[error("Failed to build upstream request: {0}")]
    RequestBuild(#[from] hyper::http::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Upstream did not respond within {} seconds", .0.as_secs())]
    Timeout(Duration),
}

impl ProxyError {
    pub fn code(&self) -> HostingErrorCode {
        match self {
            ProxyError::ForwardingLoop => HostingErrorCode::ForwardingLoop,
            ProxyError::UnsupportedTarget(_) => HostingErrorCode::UnsupportedTarget,
            ProxyError::RequestBuild(_) => HostingErrorCode::InternalError,
            ProxyError::Pool(_) => HostingErrorCode::UpstreamUnavailable,
            ProxyError::Timeout(_) => HostingErrorCode::UpstreamTimeout,
        }
    }
}

/// Tunables of the reverse proxy
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// How long to wait for the upstream response headers
    pub response_timeout: Duration,
    /// `Max-Forwards` assumed when the inbound request has none
    pub default_max_forwards: u32,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            default_max_forwards: 5,
        }
    }
}

/// Forwards requests to remote origins through the shared connection pool
pub struct ReverseProxy {
    pool: Arc<ConnectionPool>,
    settings: ProxySettings,
}

impl ReverseProxy {
    pub fn new(pool: Arc<ConnectionPool>, settings: ProxySettings) -> Self {
        Self { pool, settings }
    }

    /// Forward `req` to `target` and return the upstream response.
    ///
    /// Failures are turned into JSON error responses here; nothing is retried.
    pub async fn forward(
        &self,
        target: &Uri,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        match self.try_forward(target, req, client_addr).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    ProxyError::ForwardingLoop => {
                        warn!(url = %target, "Refusing to forward, Max-Forwards exhausted");
                    }
                    ProxyError::Timeout(_) => warn!(url = %target, error = %e, "Upstream timed out"),
                    ProxyError::UnsupportedTarget(_) => {
                        warn!(url = %target, "Mapping points at an unsupported URL")
                    }
                    _ => error!(url = %target, error = %e, "Failed to forward request"),
                }
                json_error_response(e.code(), e.to_string())
            }
        }
    }

    async fn try_forward(
        &self,
        target: &Uri,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
        if target.scheme_str() != Some("http") || target.host().is_none() {
            return Err(ProxyError::UnsupportedTarget(target.to_string()));
        }

        let max_forwards = outbound_max_forwards(req.headers(), self.settings.default_max_forwards)?;

        let (parts, body) = req.into_parts();
        let sends_body = parts.method == Method::POST || parts.method == Method::PUT;
        let headers = outbound_headers(&parts.headers, target, client_addr, max_forwards, sends_body);

        let body = if sends_body {
            body.boxed()
        } else {
            Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
        };

        let mut outbound = Request::builder()
            .method(parts.method.clone())
            .uri(target.clone())
            .body(body)?;
        *outbound.headers_mut() = headers;

        debug!(method = %parts.method, url = %target, max_forwards, "Forwarding request");

        let response = tokio::time::timeout(self.settings.response_timeout, self.pool.send(outbound))
            .await
            .map_err(|_| ProxyError::Timeout(self.settings.response_timeout))??;

        let (mut parts, body) = response.into_parts();
        parts.headers = inbound_headers(&parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// `Max-Forwards` for the outbound request.
///
/// Absent or non-numeric values count as `default`; negative values count as
/// zero. A value of 1 or less means this hop would be the last and the
/// request is refused.
pub fn outbound_max_forwards(headers: &HeaderMap, default: u32) -> Result<u32, ProxyError> {
    let value = headers
        .get(MAX_FORWARDS)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v.clamp(0, i64::from(u32::MAX)) as u32)
        .unwrap_or(default);
    if value <= 1 {
        return Err(ProxyError::ForwardingLoop);
    }
    Ok(value - 1)
}

/// Header names listed in `Connection`, lowercased. `keep-alive` and `close`
/// are connection options rather than header names and are ignored.
pub fn connection_listed(headers: &HeaderMap) -> HashSet<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty() && token != "keep-alive" && token != "close")
        .collect()
}

fn is_hop_by_hop(name: &HeaderName, listed: &HashSet<String>) -> bool {
    HOP_BY_HOP.contains(&name.as_str()) || listed.contains(name.as_str())
}

/// `Host` value for `target`: its host plus the port when it is not the default
pub fn target_host_header(target: &Uri) -> Option<String> {
    let host = target.host()?;
    let default_port = match target.scheme_str() {
        Some("https") => 443,
        _ => 80,
    };
    Some(match target.port_u16() {
        Some(port) if port != default_port => format!("{}:{}", host, port),
        _ => host.to_string(),
    })
}

/// Headers for the request sent upstream
pub fn outbound_headers(
    inbound: &HeaderMap,
    target: &Uri,
    client_addr: SocketAddr,
    max_forwards: u32,
    sends_body: bool,
) -> HeaderMap {
    let listed = connection_listed(inbound);
    let mut headers = HeaderMap::with_capacity(inbound.len() + 4);

    for (name, value) in inbound {
        if *name == HOST || *name == MAX_FORWARDS || is_hop_by_hop(name, &listed) {
            continue;
        }
        if *name == CONTENT_LENGTH && !sends_body {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(host) = target_host_header(target).and_then(|h| HeaderValue::from_str(&h).ok()) {
        headers.insert(HOST, host);
    }
    headers.insert(MAX_FORWARDS, HeaderValue::from(max_forwards));
    headers.append(VIA, HeaderValue::from_static(VIA_MARKER));

    if !headers.contains_key(X_FORWARDED_FOR) {
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if disables_caching(inbound) && !headers.contains_key(PRAGMA) {
        debug!("Inbound request disables caching");
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    }

    headers
}

/// Whether `Cache-Control` asks for `no-cache` or `no-store`
pub fn disables_caching(headers: &HeaderMap) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|directive| directive.trim().to_ascii_lowercase())
        .any(|directive| directive == "no-cache" || directive == "no-store")
}

/// Headers of the upstream response as returned to the client.
///
/// `Date` and `Server` are dropped so the serving layer sets its own.
pub fn inbound_headers(upstream: &HeaderMap) -> HeaderMap {
    let listed = connection_listed(upstream);
    let mut headers = HeaderMap::with_capacity(upstream.len() + 1);

    for (name, value) in upstream {
        if *name == DATE || *name == SERVER || is_hop_by_hop(name, &listed) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.append(VIA, HeaderValue::from_static(VIA_MARKER));
    headers
}
