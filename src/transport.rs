//! Forwarding of routed requests over pooled backend sessions

use crate::error::RelayErrorCode;
use crate::identity::{Identity, IdentityError};
use crate::pool::Pool;
use crate::session::{BoxError, RelayBody, SessionError};
use hyper::body::{Body, Bytes};
use hyper::{Request, Response, Uri};
use thiserror::Error;

/// A public request tagged with the backend it targets
#[derive(Debug)]
pub struct RoutedRequest<B> {
    /// Key hash segment taken from the request path, not yet decoded
    pub backend: String,
    /// The request as it should reach the backend, path prefix removed
    pub request: Request<B>,
}

/// Reasons a routed request could not be forwarded
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid backend key hash: {0}")]
    MalformedIdentity(#[from] IdentityError),
    #[error("backend {0} unavailable")]
    BackendUnavailable(Identity),
    #[error("backend session failed: {0}")]
    Session(#[from] SessionError),
    #[error("invalid outbound request: {0}")]
    InvalidRequest(#[from] http::Error),
}

impl ForwardError {
    pub fn code(&self) -> RelayErrorCode {
        match self {
            ForwardError::MalformedIdentity(_) => RelayErrorCode::MalformedIdentity,
            ForwardError::BackendUnavailable(_) => RelayErrorCode::BackendUnavailable,
            ForwardError::Session(_) | ForwardError::InvalidRequest(_) => RelayErrorCode::ForwardFailed,
        }
    }

    /// Message safe to show to the requester
    pub fn public_message(&self) -> &'static str {
        match self {
            ForwardError::MalformedIdentity(_) => "invalid backend key hash",
            ForwardError::BackendUnavailable(_) => "backend unavailable",
            ForwardError::Session(_) | ForwardError::InvalidRequest(_) => "failed to reach backend",
        }
    }
}

/// Executes routed requests on the session registered for their backend
#[derive(Debug, Clone)]
pub struct Transport {
    pool: Pool,
}

impl Transport {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Forward `routed` and return the backend's response, body still streaming
    pub async fn round_trip<B>(&self, routed: RoutedRequest<B>) -> Result<Response<RelayBody>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send,
    {
        let identity: Identity = routed.backend.parse()?;
        let session = self
            .pool
            .lookup(&identity)
            .ok_or(ForwardError::BackendUnavailable(identity))?;

        let mut request = routed.request;
        *request.uri_mut() = backend_uri(&identity, request.uri())?;

        Ok(session.send_request(request).await?)
    }
}

/// Absolute URI addressing `identity` over its session; the query is kept verbatim
fn backend_uri(identity: &Identity, uri: &Uri) -> Result<Uri, http::Error> {
    let authority = identity.to_hex();
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    Uri::builder()
        .scheme("https")
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
}
