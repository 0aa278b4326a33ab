//! Error types and JSON error responses for the front door

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Why a configured worker was not launched
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("routing namespace '{0}' is too short (minimum {min} characters)", min = crate::worker::MIN_NAMESPACE_LEN)]
    NamespaceTooShort(String),

    #[error("routing namespace '{0}' must be a single path segment")]
    NamespaceInvalid(String),

    #[error("failed to assign unique port {port} for '{namespace}'")]
    PortInUse { namespace: String, port: u16 },

    #[error("no free port available for '{0}'")]
    PortsExhausted(String),

    #[error("failed to locate executable '{0}'")]
    ExecutableNotFound(String),

    #[error("failed to start worker process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Registry insert rejections. Existing entries are never overwritten.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("namespace '{0}' is already registered")]
    NamespaceTaken(String),

    #[error("port {port} is already held by '{holder}'")]
    PortTaken { port: u16, holder: String },
}

/// Error codes for front door errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No worker registered under the namespace
    UnknownNamespace,
    /// Worker registered but has not signalled Ready
    WorkerNotReady,
    /// Path did not match any route and could not be recovered
    NotFound,
    /// Request timed out waiting for the worker
    RequestTimeout,
    /// Failed to connect to the worker
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownNamespace => StatusCode::NOT_FOUND,
            ProxyErrorCode::WorkerNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownNamespace => "UNKNOWN_NAMESPACE",
            ProxyErrorCode::WorkerNotReady => "WORKER_NOT_READY",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

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

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
