//! Error responses served by the relay

use crate::session::RelayBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header naming the relay error code on error responses
pub const X_RELAY_ERROR: &str = "x-relay-error";

/// Body served when the request path does not name a backend
pub const MALFORMED_PATH_MESSAGE: &str = "request must start with /KEY_HASH/";

/// Error codes for relay errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayErrorCode {
    /// Path is not of the form /KEY_HASH/...
    MalformedPath,
    /// Key hash is not 32 bytes of hex
    MalformedIdentity,
    /// No session registered for the key hash
    BackendUnavailable,
    /// The backend session failed the exchange
    ForwardFailed,
}

impl RelayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayErrorCode::MalformedPath => StatusCode::NOT_FOUND,
            RelayErrorCode::MalformedIdentity => StatusCode::BAD_GATEWAY,
            RelayErrorCode::BackendUnavailable => StatusCode::BAD_GATEWAY,
            RelayErrorCode::ForwardFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Relay-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            RelayErrorCode::MalformedPath => "MALFORMED_PATH",
            RelayErrorCode::MalformedIdentity => "MALFORMED_IDENTITY",
            RelayErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            RelayErrorCode::ForwardFailed => "FORWARD_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: RelayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: RelayErrorCode, message: impl Into<String>) -> Self {
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

fn full(body: impl Into<Bytes>) -> RelayBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with X-Relay-Error header
pub fn json_error_response(code: RelayErrorCode, message: impl Into<String>) -> Response<RelayBody> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(X_RELAY_ERROR, code.as_header_value())
        .body(full(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Plain-text 404 for paths that do not start with a key hash segment
pub fn malformed_path_response() -> Response<RelayBody> {
    let code = RelayErrorCode::MalformedPath;

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(X_RELAY_ERROR, code.as_header_value())
        .body(full(format!("{}\n", MALFORMED_PATH_MESSAGE)))
        .expect("valid response with StatusCode enum and static headers")
}
