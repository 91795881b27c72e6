//! Site configuration API
//!
//! Requests that are not addressed to a hosted site end up here. The API lets
//! a user manage their site configurations and start or stop hosting them.
//! Callers authenticate with the admin bearer token; the acting user is taken
//! from `X-Remote-User`, as set by the authentication layer in front of us.

use crate::error::{full_body, HostingError};
use crate::pool::PoolStats;
use crate::registry::SiteRegistry;
use crate::site::{SiteConfiguration, SiteStore, SiteUpdate};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, HOST, LOCATION};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Identity of the authenticated user
pub const X_REMOTE_USER: &str = "x-remote-user";

/// Preferred name of a newly created site
const SLUG: &str = "slug";

const SITE_PATH: &str = "/site";
const STATUS_STARTED: &str = "started";
const STATUS_STOPPED: &str = "stopped";

/// Upper bound on request bodies
const MAX_BODY_BYTES: usize = 1024 * 1024;

type ApiResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Hosting state of a site configuration as reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostingStatus {
    pub status: String,
    #[serde(rename = "URL", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A site configuration decorated with its hosting state
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SiteView {
    #[serde(flatten)]
    site: SiteConfiguration,
    hosting_status: HostingStatus,
    location: String,
}

/// Body of a create or update request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SiteRequest {
    #[serde(flatten)]
    update: SiteUpdate,
    hosting_status: Option<HostingStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DesiredStatus {
    Started,
    Stopped,
}

impl DesiredStatus {
    fn parse(status: &str) -> Option<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            STATUS_STARTED => Some(DesiredStatus::Started),
            STATUS_STOPPED => Some(DesiredStatus::Stopped),
            _ => None,
        }
    }
}

/// Handler for the site configuration API
pub struct SiteApi {
    store: Arc<dyn SiteStore>,
    registry: Arc<SiteRegistry>,
    pool_stats: Arc<PoolStats>,
    auth_token: Arc<String>,
}

impl SiteApi {
    pub fn new(
        store: Arc<dyn SiteStore>,
        registry: Arc<SiteRegistry>,
        pool_stats: Arc<PoolStats>,
        auth_token: String,
    ) -> Self {
        Self {
            store,
            registry,
            pool_stats,
            auth_token: Arc::new(auth_token),
        }
    }

    fn check_auth(&self, req: &Request<Incoming>) -> bool {
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(self.auth_token.as_str()))
            .unwrap_or(false)
    }

    pub async fn handle(&self, req: Request<Incoming>) -> ApiResponse {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "Site API request");

        match (&method, path.as_str()) {
            (&Method::GET, "/health") => return json_response(StatusCode::OK, r#"{"status":"ok"}"#),
            (&Method::GET, "/version") => {
                let version = serde_json::json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                });
                return json_response(StatusCode::OK, version.to_string());
            }
            _ => {}
        }

        if !self.check_auth(&req) {
            warn!(%path, "Unauthorized site API request");
            return json_error(StatusCode::UNAUTHORIZED, "unauthorized");
        }

        if method == Method::GET && path == "/hosted" {
            return self.list_hosted();
        }

        let user = match req
            .headers()
            .get(X_REMOTE_USER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|u| !u.is_empty())
        {
            Some(user) => user.to_string(),
            None => return json_error(StatusCode::UNAUTHORIZED, "missing X-Remote-User"),
        };

        let result = if path == SITE_PATH {
            match method {
                Method::GET => Ok(self.list_sites(&user)),
                Method::POST => self.create_site(&user, req).await,
                _ => Ok(method_not_allowed()),
            }
        } else if let Some(id) = path
            .strip_prefix(SITE_PATH)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|id| !id.is_empty() && !id.contains('/'))
        {
            match method {
                Method::GET => Ok(self.get_site(&user, id)),
                Method::PUT => self.update_site(&user, id, req).await,
                Method::DELETE => Ok(self.delete_site(&user, id)),
                _ => Ok(method_not_allowed()),
            }
        } else {
            Ok(json_error(StatusCode::NOT_FOUND, "not found"))
        };

        result.unwrap_or_else(|e| {
            error!(%path, error = %e, "Site API request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Internal error: {}", e))
        })
    }

    fn list_hosted(&self) -> ApiResponse {
        let sites: Vec<serde_json::Value> = self
            .registry
            .list()
            .iter()
            .map(|site| {
                serde_json::json!({
                    "host": site.host,
                    "url": site.url,
                    "site": site.site_configuration_id,
                    "user": site.user_id,
                    "workspace": site.workspace_id,
                    "name": site.name,
                })
            })
            .collect();
        let body = serde_json::json!({
            "count": sites.len(),
            "sites": sites,
            "pool": self.registry.pool().to_string(),
            "upstream": self.pool_stats.snapshot(),
        });
        json_response(StatusCode::OK, body.to_string())
    }

    fn list_sites(&self, user: &str) -> ApiResponse {
        let views: Vec<SiteView> = self
            .store
            .list(user)
            .into_iter()
            .map(|site| self.view(user, site))
            .collect();
        let body = serde_json::json!({ "SiteConfigurations": views });
        json_response(StatusCode::OK, body.to_string())
    }

    fn get_site(&self, user: &str, id: &str) -> ApiResponse {
        match self.store.get(user, id) {
            Some(site) => view_response(StatusCode::OK, &self.view(user, site)),
            None => json_error(StatusCode::NOT_FOUND, format!("Site configuration {} not found", id)),
        }
    }

    async fn create_site(&self, user: &str, req: Request<Incoming>) -> anyhow::Result<ApiResponse> {
        let slug = req
            .headers()
            .get(SLUG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let (edit_server, scheme) = request_origin(&req);
        let body = match read_site_request(req).await {
            Ok(body) => body,
            Err(response) => return Ok(response),
        };

        let status = match desired_status(&body) {
            Ok(status) => status,
            Err(response) => return Ok(response),
        };

        let mut site = SiteConfiguration::new(slug.as_deref().unwrap_or(""), "");
        if let Err(msg) = body.update.apply(&mut site, slug.is_none()) {
            return Ok(json_error(StatusCode::BAD_REQUEST, msg));
        }

        let site = self.store.insert(user, site);
        info!(site = %site.id, user, name = %site.name, "Created site configuration");

        if let Some(status) = status {
            if let Err(e) = self.change_status(user, &site, status, &edit_server, &scheme) {
                self.store.delete(user, &site.id);
                return Ok(hosting_error(e));
            }
        }

        let view = self.view(user, site);
        let mut response = view_response(StatusCode::CREATED, &view);
        if let Ok(location) = HeaderValue::from_str(&view.location) {
            response.headers_mut().insert(LOCATION, location);
        }
        Ok(response)
    }

    async fn update_site(
        &self,
        user: &str,
        id: &str,
        req: Request<Incoming>,
    ) -> anyhow::Result<ApiResponse> {
        let Some(mut site) = self.store.get(user, id) else {
            return Ok(json_error(StatusCode::NOT_FOUND, format!("Site configuration {} not found", id)));
        };

        let (edit_server, scheme) = request_origin(&req);
        let body = match read_site_request(req).await {
            Ok(body) => body,
            Err(response) => return Ok(response),
        };
        let status = match desired_status(&body) {
            Ok(status) => status,
            Err(response) => return Ok(response),
        };

        if let Err(msg) = body.update.apply(&mut site, true) {
            return Ok(json_error(StatusCode::BAD_REQUEST, msg));
        }

        if let Some(status) = status {
            if let Err(e) = self.change_status(user, &site, status, &edit_server, &scheme) {
                return Ok(hosting_error(e));
            }
        }

        self.store.save(user, site.clone());
        debug!(site = %site.id, user, "Updated site configuration");
        Ok(view_response(StatusCode::OK, &self.view(user, site)))
    }

    fn delete_site(&self, user: &str, id: &str) -> ApiResponse {
        if self.store.get(user, id).is_none() {
            return json_error(StatusCode::NOT_FOUND, format!("Site configuration {} not found", id));
        }
        if self.registry.lookup_by_configuration(id, user).is_some() {
            return json_error(
                StatusCode::CONFLICT,
                "Site configuration is running; stop it before deleting",
            );
        }

        self.store.delete(user, id);
        info!(site = id, user, "Deleted site configuration");
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(full_body(Bytes::new()))
            .expect("valid response with StatusCode enum")
    }

    fn change_status(
        &self,
        user: &str,
        site: &SiteConfiguration,
        status: DesiredStatus,
        edit_server: &str,
        scheme: &str,
    ) -> Result<(), HostingError> {
        match status {
            DesiredStatus::Started => {
                self.registry.start(site, user, edit_server, scheme)?;
            }
            DesiredStatus::Stopped => {
                self.registry.stop(&site.id, user);
            }
        }
        Ok(())
    }

    fn view(&self, user: &str, site: SiteConfiguration) -> SiteView {
        let hosting_status = match self.registry.lookup_by_configuration(&site.id, user) {
            Some(hosted) => HostingStatus {
                status: STATUS_STARTED.to_string(),
                url: Some(hosted.url.clone()),
            },
            None => HostingStatus {
                status: STATUS_STOPPED.to_string(),
                url: None,
            },
        };
        SiteView {
            location: format!("{}/{}", SITE_PATH, site.id),
            site,
            hosting_status,
        }
    }
}

/// Origin of the authoring server and the scheme hosted URLs should use
fn request_origin(req: &Request<Incoming>) -> (String, String) {
    let scheme = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|p| *p == "http" || *p == "https")
        .unwrap_or("http")
        .to_string();
    let edit_server = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|host| format!("{}://{}", scheme, host))
        .unwrap_or_default();
    (edit_server, scheme)
}

async fn read_site_request(req: Request<Incoming>) -> Result<SiteRequest, ApiResponse> {
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e)))?
        .to_bytes();
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(SiteRequest::default());
    }
    serde_json::from_slice(&body)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)))
}

fn desired_status(body: &SiteRequest) -> Result<Option<DesiredStatus>, ApiResponse> {
    match &body.hosting_status {
        None => Ok(None),
        Some(hosting) => DesiredStatus::parse(&hosting.status)
            .map(Some)
            .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "Status not understood")),
    }
}

fn hosting_error(e: HostingError) -> ApiResponse {
    warn!(error = %e, "Failed to change hosting status");
    let status = match e {
        HostingError::NoHostsAvailable => StatusCode::INTERNAL_SERVER_ERROR,
        HostingError::InvalidHostHint(_) => StatusCode::BAD_REQUEST,
    };
    json_error(status, e.to_string())
}

fn view_response(status: StatusCode, view: &SiteView) -> ApiResponse {
    match serde_json::to_string(view) {
        Ok(body) => json_response(status, body),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Internal error: {}", e)),
    }
}

fn method_not_allowed() -> ApiResponse {
    json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> ApiResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    let body = serde_json::json!({ "error": message.into() });
    json_response(status, body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::Mapping;

    #[test]
    fn test_desired_status_parse() {
        assert_eq!(DesiredStatus::parse("started"), Some(DesiredStatus::Started));
        assert_eq!(DesiredStatus::parse(" Stopped "), Some(DesiredStatus::Stopped));
        assert_eq!(DesiredStatus::parse("paused"), None);
    }

    #[test]
    fn test_site_request_shape() {
        let body: SiteRequest = serde_json::from_str(
            r#"{"Name":"Blog","Workspace":"ws1","Mappings":[{"Source":"/","Target":"/projA"}],"HostingStatus":{"Status":"started"}}"#,
        )
        .unwrap();

        assert_eq!(body.update.name.as_deref(), Some("Blog"));
        assert_eq!(body.update.workspace.as_deref(), Some("ws1"));
        assert_eq!(body.update.mappings, Some(vec![Mapping::new("/", "/projA")]));
        assert_eq!(body.hosting_status.unwrap().status, "started");
    }

    #[test]
    fn test_site_view_shape() {
        let mut site = SiteConfiguration::new("Blog", "ws1");
        site.id = "alice-0".to_string();
        let view = SiteView {
            location: "/site/alice-0".to_string(),
            site,
            hosting_status: HostingStatus {
                status: "started".to_string(),
                url: Some("http://127.0.0.2:8080".to_string()),
            },
        };
        let json = serde_json::to_value(&view).unwrap();

        assert_eq!(json["Id"], "alice-0");
        assert_eq!(json["Workspace"], "ws1");
        assert_eq!(json["Location"], "/site/alice-0");
        assert_eq!(json["HostingStatus"]["Status"], "started");
        assert_eq!(json["HostingStatus"]["URL"], "http://127.0.0.2:8080");
    }

    #[test]
    fn test_stopped_status_omits_url() {
        let status = HostingStatus {
            status: "stopped".to_string(),
            url: None,
        };
        assert_eq!(serde_json::to_string(&status).unwrap(), r#"{"Status":"stopped"}"#);
    }
}
