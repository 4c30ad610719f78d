//! Public request routing
//!
//! Requests rooted at `/<hex key hash>/` are rewritten for the backend that
//! authenticated with that key and forwarded over its session. Anything else
//! gets a 404.

use crate::error::{json_error_response, malformed_path_response};
use crate::pool::Pool;
use crate::session::{BoxError, RelayBody};
use crate::transport::{RoutedRequest, Transport};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, TE};
use hyper::{Request, Response, Uri};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Connection-specific headers HTTP/2 does not allow
const HOP_BY_HOP: [&str; 5] = ["keep-alive", "proxy-connection", "transfer-encoding", "upgrade", "connection"];

/// Routes public requests to backend sessions
#[derive(Debug, Clone)]
pub struct Router {
    transport: Transport,
}

impl Router {
    pub fn new(pool: Pool) -> Self {
        Self {
            transport: Transport::new(pool),
        }
    }

    pub fn pool(&self) -> &Pool {
        self.transport.pool()
    }

    /// Serve one public request. Never fails: errors become responses.
    pub async fn handle<B>(&self, request: Request<B>, client_addr: SocketAddr) -> Response<RelayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send,
    {
        let method = request.method().clone();
        let Some(routed) = route(request, client_addr.ip()) else {
            debug!(addr = %client_addr, %method, "Request path does not name a backend");
            return malformed_path_response();
        };

        let backend = routed.backend.clone();
        let request_id = routed
            .request
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        debug!(backend, %method, uri = %routed.request.uri(), request_id, "Forwarding request");

        match self.transport.round_trip(routed).await {
            Ok(response) => response,
            Err(e) => {
                warn!(backend, request_id, error = %e, "Failed to forward request");
                json_error_response(e.code(), e.public_message())
            }
        }
    }
}

/// Split `/<key hash>/<rest>` into the key hash and `rest`
pub fn split_backend_path(path: &str) -> Option<(&str, &str)> {
    path.strip_prefix('/')?.split_once('/')
}

/// Rewrite a public request for its backend.
///
/// Returns `None` when the path does not start with a key hash segment.
pub fn route<B>(mut request: Request<B>, client_ip: IpAddr) -> Option<RoutedRequest<B>> {
    let (backend, uri) = {
        let (backend, rest) = split_backend_path(request.uri().path())?;
        let path_and_query = match request.uri().query() {
            Some(query) => format!("/{}?{}", rest, query),
            None => format!("/{}", rest),
        };
        let uri = Uri::builder().path_and_query(path_and_query).build().ok()?;
        (backend.to_string(), uri)
    };

    let original_host = request
        .headers()
        .get(HOST)
        .cloned()
        .or_else(|| {
            request
                .uri()
                .authority()
                .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
        });

    *request.uri_mut() = uri;
    let headers = request.headers_mut();
    remove_hop_by_hop(headers);
    set_forwarded_headers(headers, client_ip, original_host);
    ensure_request_id(headers);

    Some(RoutedRequest { backend, request })
}

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    let keep_trailers = headers.get_all(TE).iter().any(|v| {
        v.to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("trailers")))
            .unwrap_or(false)
    });

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(TE);
    headers.remove(HOST);

    if keep_trailers {
        headers.insert(TE, HeaderValue::from_static("trailers"));
    }
}

fn set_forwarded_headers(headers: &mut HeaderMap, client_ip: IpAddr, original_host: Option<HeaderValue>) {
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let forwarded_for = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    match original_host {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host);
        }
        None => {
            headers.remove(X_FORWARDED_HOST);
        }
    }

    // The relay only serves public requests over TLS
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
}

fn ensure_request_id(headers: &mut HeaderMap) {
    if headers.contains_key(X_REQUEST_ID) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
        headers.insert(X_REQUEST_ID, value);
    }
}
