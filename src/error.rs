//! Error handling and JSON error responses for the hosting pipeline

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Header carrying the machine-readable error code on error responses
pub const X_HOSTING_ERROR: &str = "x-hosting-error";

/// Errors raised while starting or stopping hosted sites
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostingError {
    /// Every IP alias and literal domain of the pool is taken and there is no wildcard
    #[error("No more hosts available")]
    NoHostsAvailable,

    /// The hint cannot be turned into a hostname label
    #[error("Invalid host hint '{0}'. Only hostname characters are permitted")]
    InvalidHostHint(String),
}

/// Error codes for responses produced by the hosting pipeline itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostingErrorCode {
    /// Missing or malformed Host header
    MissingHostHeader,
    /// Host belongs to the pool but no site is running on it
    UnknownHost,
    /// No mapping of the site matched the request path
    NoMapping,
    /// Mapped workspace file does not exist
    FileNotFound,
    /// Workspace paths only support GET and HEAD
    MethodNotAllowed,
    /// Site owner cannot read the mapped workspace path
    AccessDenied,
    /// Max-Forwards exhausted
    ForwardingLoop,
    /// Upstream could not be reached
    UpstreamUnavailable,
    /// Mapped remote URL uses a scheme the proxy cannot speak
    UnsupportedTarget,
    /// Upstream did not answer in time
    UpstreamTimeout,
    /// Internal error
    InternalError,
}

impl HostingErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            HostingErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            HostingErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            HostingErrorCode::NoMapping => StatusCode::NOT_FOUND,
            HostingErrorCode::FileNotFound => StatusCode::NOT_FOUND,
            HostingErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            HostingErrorCode::AccessDenied => StatusCode::FORBIDDEN,
            HostingErrorCode::ForwardingLoop => StatusCode::BAD_GATEWAY,
            HostingErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            HostingErrorCode::UnsupportedTarget => StatusCode::BAD_GATEWAY,
            HostingErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            HostingErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Hosting-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            HostingErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            HostingErrorCode::UnknownHost => "UNKNOWN_HOST",
            HostingErrorCode::NoMapping => "NO_MAPPING",
            HostingErrorCode::FileNotFound => "FILE_NOT_FOUND",
            HostingErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            HostingErrorCode::AccessDenied => "ACCESS_DENIED",
            HostingErrorCode::ForwardingLoop => "FORWARDING_LOOP",
            HostingErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            HostingErrorCode::UnsupportedTarget => "UNSUPPORTED_TARGET",
            HostingErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            HostingErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: HostingErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: HostingErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with the X-Hosting-Error header
pub fn json_error_response(
    code: HostingErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(X_HOSTING_ERROR, code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Box a complete in-memory body
pub fn full_body(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}
