//! Request routing for hosted sites
//!
//! Every inbound request passes through [`Router::dispatch`] first. A request
//! reaches a hosted site either through its `Host` header or through the
//! path-forwarded form `/hosted/<host:port>/<path>`. Anything else is handed
//! back to the caller untouched.

use crate::error::{full_body, json_error_response, HostingErrorCode};
use crate::mapping::Resolution;
use crate::proxy::ReverseProxy;
use crate::registry::{HostedSite, SiteRegistry};
use crate::workspace::{
    resource_location, AccessControl, LocationKind, WorkspaceError, WorkspaceFile, WorkspaceStore,
};
use futures::{future, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

/// Path prefix of the path-forwarded form
pub const HOSTED_PATH_PREFIX: &str = "/hosted/";

/// Back-link to the editor for a served file
const X_EDIT_SERVER: &str = "x-edit-server";
/// Workspace location of a served file
const X_EDIT_TOKEN: &str = "x-edit-token";

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

type HostingBody = BoxBody<Bytes, hyper::Error>;
type HostingResponse = Response<HostingBody>;

/// Outcome of routing a request
pub enum Dispatch {
    /// The hosting pipeline produced the response
    Handled(HostingResponse),
    /// Not addressed to a hosted site; continue with the normal pipeline
    NotHosted(Request<Incoming>),
}

/// Routes requests for hosted sites to local files or the reverse proxy
pub struct Router {
    registry: Arc<SiteRegistry>,
    workspaces: Arc<dyn WorkspaceStore>,
    access: Arc<dyn AccessControl>,
    proxy: Arc<ReverseProxy>,
}

impl Router {
    pub fn new(
        registry: Arc<SiteRegistry>,
        workspaces: Arc<dyn WorkspaceStore>,
        access: Arc<dyn AccessControl>,
        proxy: Arc<ReverseProxy>,
    ) -> Self {
        Self {
            registry,
            workspaces,
            access,
            proxy,
        }
    }

    /// Route a request. The `Host` header wins when it names a running site,
    /// so a site's own `/hosted/...` paths still resolve against its mappings.
    pub async fn dispatch(&self, req: Request<Incoming>, client_addr: SocketAddr) -> Dispatch {
        let hostname = request_host(&req).and_then(|value| {
            let hostname = parse_hostname(&value);
            if hostname.is_none() {
                debug!(host = %value, "Host header is not a hosted site name");
            }
            hostname
        });

        if let Some(hostname) = &hostname {
            if let Some(site) = self.registry.lookup_by_host(&self.host_key(hostname)) {
                let path = req.uri().path().to_string();
                return Dispatch::Handled(self.serve(&site, &path, req, client_addr).await);
            }
        }

        if let Some(forwarded) = req.uri().path().strip_prefix(HOSTED_PATH_PREFIX) {
            let (host, path) = match forwarded.split_once('/') {
                Some((host, rest)) => (host.to_string(), format!("/{}", rest)),
                None => (forwarded.to_string(), "/".to_string()),
            };
            return Dispatch::Handled(self.dispatch_path_form(&host, &path, req, client_addr).await);
        }

        match hostname {
            Some(hostname) if self.registry.pool().matches_virtual_host(&hostname) => {
                let host = self.host_key(&hostname);
                debug!(host = %host, "Request for virtual host with no running site");
                Dispatch::Handled(not_hosted(&host))
            }
            _ => Dispatch::NotHosted(req),
        }
    }

    async fn dispatch_path_form(
        &self,
        host: &str,
        path: &str,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> HostingResponse {
        let host = host.to_ascii_lowercase();
        if host.is_empty() || parse_hostname(&host).is_none() {
            return json_error_response(
                HostingErrorCode::MissingHostHeader,
                "Missing or invalid host in hosted path",
            );
        }
        let host = if has_port(&host) { host } else { self.host_key(&host) };

        match self.registry.lookup_by_host(&host) {
            Some(site) => self.serve(&site, path, req, client_addr).await,
            None => {
                debug!(host = %host, "Path-forwarded request for unknown site");
                not_hosted(&host)
            }
        }
    }

    /// Registry key for a bare hostname: always uses the hosting port
    fn host_key(&self, hostname: &str) -> String {
        format!("{}:{}", hostname, self.registry.pool().port())
    }

    async fn serve(
        &self,
        site: &HostedSite,
        path: &str,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> HostingResponse {
        let resolution = site.resolve(path, req.uri().query());
        debug!(host = %site.host, path, ?resolution, "Routing hosted request");

        match resolution {
            None => json_error_response(
                HostingErrorCode::NoMapping,
                format!("No mapping for {} on {}", path, site.host),
            ),
            Some(Resolution::Local(local)) => self.serve_local(site, req.method(), &local).await,
            Some(Resolution::Remote(url)) => self.proxy.forward(&url, req, client_addr).await,
        }
    }

    async fn serve_local(&self, site: &HostedSite, method: &Method, path: &str) -> HostingResponse {
        if method != Method::GET && method != Method::HEAD {
            let mut response = json_error_response(
                HostingErrorCode::MethodNotAllowed,
                format!("{} is not supported for workspace files", method),
            );
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }

        let workspace = resource_location(LocationKind::Workspace, &site.workspace_id);
        if !self.access.can_read(&site.user_id, &workspace) {
            warn!(user = %site.user_id, location = %workspace, host = %site.host, "Site owner cannot read workspace");
            return json_error_response(
                HostingErrorCode::AccessDenied,
                format!("No rights to access {}", workspace),
            );
        }

        let file = match self.locate(&site.workspace_id, path).await {
            Ok(file) => file,
            Err(WorkspaceError::Io(e)) => {
                error!(path, error = %e, "Failed to read workspace");
                return json_error_response(HostingErrorCode::InternalError, "Failed to read workspace");
            }
            Err(e) => {
                debug!(path, error = %e, "Workspace file not served");
                return json_error_response(
                    HostingErrorCode::FileNotFound,
                    format!("File not found: {}", path),
                );
            }
        };

        let body = if method == Method::HEAD {
            full_body(Bytes::new())
        } else {
            match tokio::fs::File::open(&file.path).await {
                Ok(handle) => file_body(handle, file.path.clone()),
                Err(e) => {
                    error!(path = %file.path.display(), error = %e, "Failed to open file");
                    return json_error_response(HostingErrorCode::InternalError, "Failed to read file");
                }
            }
        };

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, file.content_type)
            .header(CONTENT_LENGTH, file.size)
            .body(body)
            .expect("valid response with static headers");
        add_edit_headers(&mut response, site, path);
        response
    }

    async fn locate(&self, workspace_id: &str, path: &str) -> Result<WorkspaceFile, WorkspaceError> {
        let workspaces = Arc::clone(&self.workspaces);
        let workspace_id = workspace_id.to_string();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || workspaces.locate(&workspace_id, &path))
            .await
            .map_err(|e| WorkspaceError::Io(std::io::Error::other(e)))?
    }
}

/// Stream a file in chunks. A read error ends the body early; the declared
/// `Content-Length` then tells the client the response is incomplete.
fn file_body(file: tokio::fs::File, path: PathBuf) -> HostingBody {
    let frames = ReaderStream::new(file).scan((), move |_, chunk| {
        future::ready(match chunk {
            Ok(bytes) => Some(Ok::<_, hyper::Error>(Frame::data(bytes))),
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read file");
                None
            }
        })
    });
    BodyExt::boxed(StreamBody::new(frames))
}

fn add_edit_headers(response: &mut HostingResponse, site: &HostedSite, path: &str) {
    let headers = response.headers_mut();
    if !site.edit_server_url.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&format!("{}/coding.html#", site.edit_server_url)) {
            headers.insert(X_EDIT_SERVER, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&resource_location(LocationKind::File, path)) {
        headers.insert(X_EDIT_TOKEN, value);
    }
}

fn not_hosted(host: &str) -> HostingResponse {
    json_error_response(
        HostingErrorCode::UnknownHost,
        format!("Hosted site {} not found", host),
    )
}

/// Host the client addressed: the `Host` header, or the URI authority for HTTP/2
fn request_host(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

/// Lowercased hostname of a `host[:port]` value, or `None` if malformed
pub fn parse_hostname(value: &str) -> Option<String> {
    let value = value.trim();
    let hostname = if value.starts_with('[') {
        &value[..=value.find(']')?]
    } else {
        value.split(':').next()?
    };

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Validate characters: alphanumeric, hyphen, dot, and IPv6 brackets only
    let valid = hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '[' | ']' | ':'));
    if !valid {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

fn has_port(host: &str) -> bool {
    match host.rfind(']') {
        Some(end) => host[end..].contains(':'),
        None => host.contains(':'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hostname() {
        assert_eq!(parse_hostname("Site.Example.org:8080").as_deref(), Some("site.example.org"));
        assert_eq!(parse_hostname("127.0.0.2").as_deref(), Some("127.0.0.2"));
        assert_eq!(parse_hostname("[::1]:8080").as_deref(), Some("[::1]"));
        assert_eq!(parse_hostname(""), None);
        assert_eq!(parse_hostname("bad host"), None);
        assert_eq!(parse_hostname("evil\r\nhost"), None);
        assert_eq!(parse_hostname(&"a".repeat(254)), None);
    }

    #[test]
    fn test_has_port() {
        assert!(has_port("127.0.0.2:8080"));
        assert!(!has_port("127.0.0.2"));
        assert!(has_port("[::1]:8080"));
        assert!(!has_port("[::1]"));
    }
}
