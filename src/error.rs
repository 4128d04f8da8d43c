//! Error taxonomy and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Boxed body type used by every public-facing response
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Error codes surfaced on the public HTTP surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Requested identifier fails charset validation
    InvalidIdentifier,
    /// Random identifier generation collided past the retry budget
    IdentifierExhausted,
    /// Requested identifier is actively registered by another client
    IdentifierInUse,
    /// The per-tunnel listener could not be bound
    TunnelSetupFailed,
    /// No tunnel matches the request
    TunnelNotFound,
    /// The client's connection dropped before or during an exchange
    TunnelDisconnected,
}

impl GatewayErrorCode {
    /// HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::InvalidIdentifier => StatusCode::BAD_REQUEST,
            GatewayErrorCode::IdentifierExhausted => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::IdentifierInUse => StatusCode::CONFLICT,
            GatewayErrorCode::TunnelSetupFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::TunnelNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::TunnelDisconnected => StatusCode::BAD_GATEWAY,
        }
    }

    /// Error code string for the X-Tunnel-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::InvalidIdentifier => "INVALID_IDENTIFIER",
            GatewayErrorCode::IdentifierExhausted => "IDENTIFIER_EXHAUSTED",
            GatewayErrorCode::IdentifierInUse => "IDENTIFIER_IN_USE",
            GatewayErrorCode::TunnelSetupFailed => "TUNNEL_SETUP_FAILED",
            GatewayErrorCode::TunnelNotFound => "TUNNEL_NOT_FOUND",
            GatewayErrorCode::TunnelDisconnected => "TUNNEL_DISCONNECTED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Tunnel-Error header
pub fn gateway_response(code: GatewayErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Tunnel-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Failure modes of a tunnel allocation
#[derive(Debug, thiserror::Error)]
pub enum AllocateError {
    #[error("identifier '{0}' contains characters outside [a-z0-9]")]
    InvalidIdentifier(String),

    #[error("could not generate an unused identifier")]
    IdentifierExhausted,

    #[error("identifier '{0}' is already registered")]
    IdentifierInUse(String),

    #[error("failed to bind tunnel listener: {0}")]
    Bind(#[from] std::io::Error),
}

impl AllocateError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            AllocateError::InvalidIdentifier(_) => GatewayErrorCode::InvalidIdentifier,
            AllocateError::IdentifierExhausted => GatewayErrorCode::IdentifierExhausted,
            AllocateError::IdentifierInUse(_) => GatewayErrorCode::IdentifierInUse,
            AllocateError::Bind(_) => GatewayErrorCode::TunnelSetupFailed,
        }
    }
}
