//! HTTP/2 sessions to connected backends
//!
//! A backend's authenticated TLS connection is promoted to an HTTP/2 client
//! session: the relay is the client, the backend serves. A session carries
//! concurrent forwarded requests on independent streams, answers liveness
//! pings, reports when it has closed, and can be drained with a deadline when
//! a newer connection from the same backend supersedes it.

use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame};
use hyper::{Request, Response};
use h2::client::SendRequest;
use h2::{Ping, PingPong, Reason, RecvStream, SendStream};
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Response body type produced by forwarding, streamed from the backend
pub type RelayBody = BoxBody<Bytes, h2::Error>;

/// Boxed error for request bodies of any origin
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Timing policy for backend sessions
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between keepalive PINGs
    pub keepalive_interval: Duration,
    /// How long a keepalive PING may go unanswered before the session is closed
    pub keepalive_timeout: Duration,
    /// Deadline for the liveness check sent before a session is registered
    pub ping_timeout: Duration,
    /// How long a superseded session may keep serving in-flight streams
    pub drain_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(60),
        }
    }
}

/// Errors from session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("HTTP/2 error: {0}")]
    Protocol(#[from] h2::Error),
    #[error("session is closed")]
    Closed,
    #[error("session is draining")]
    Draining,
    #[error("no PING response within {0:?}")]
    PingTimeout(Duration),
}

/// A multiplexed connection to one backend
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    sender: SendRequest<Bytes>,
    ping_pong: Mutex<Option<PingPong>>,
    closed: watch::Sender<bool>,
    close: Notify,
    draining: AtomicBool,
    open_streams: AtomicUsize,
    idle: Notify,
}

impl Session {
    /// Promote a raw connection to a session.
    ///
    /// Spawns the task driving the connection and the keepalive task. The
    /// connection is owned by the session from here on.
    pub async fn handshake<T>(io: T, config: &SessionConfig) -> Result<Self, SessionError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, mut connection) = h2::client::handshake(io).await?;
        let ping_pong = connection.ping_pong();
        let (closed, _) = watch::channel(false);

        let session = Self {
            inner: Arc::new(Inner {
                sender,
                ping_pong: Mutex::new(ping_pong),
                closed,
                close: Notify::new(),
                draining: AtomicBool::new(false),
                open_streams: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        };

        let driver = session.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = connection => {
                    if let Err(e) = result {
                        debug!(error = %e, "Backend session ended with error");
                    }
                }
                _ = driver.inner.close.notified() => {
                    debug!("Backend session closed by relay");
                }
            }
            driver.inner.closed.send_replace(true);
        });

        session.spawn_keepalive(config.keepalive_interval, config.keepalive_timeout);

        Ok(session)
    }

    fn spawn_keepalive(&self, interval: Duration, timeout: Duration) {
        let session = self.clone();
        tokio::spawn(async move {
            let mut closed = session.inner.closed.subscribe();
            loop {
                if session.is_closed() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = closed.changed() => break,
                }
                if let Err(e) = session.ping(timeout).await {
                    if !session.is_closed() {
                        warn!(error = %e, "Backend session failed keepalive, closing");
                        session.close();
                    }
                    break;
                }
            }
        });
    }

    /// Send one PING and wait for its acknowledgement
    pub async fn ping(&self, timeout: Duration) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let mut guard = self.inner.ping_pong.lock().await;
        let ping_pong = guard.as_mut().ok_or(SessionError::Closed)?;
        match tokio::time::timeout(timeout, ping_pong.ping(Ping::opaque())).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(SessionError::PingTimeout(timeout)),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Number of forwarded exchanges currently using this session
    pub fn open_streams(&self) -> usize {
        self.inner.open_streams.load(Ordering::SeqCst)
    }

    /// Whether two handles refer to the same connection
    pub fn same_session(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolve once the underlying connection has closed
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Tear the connection down immediately, cancelling open streams
    pub fn close(&self) {
        self.inner.close.notify_one();
    }

    /// Stop accepting new requests, wait for open streams up to `deadline`,
    /// then close.
    pub async fn shutdown(&self, deadline: Duration) {
        self.inner.draining.store(true, Ordering::SeqCst);
        if tokio::time::timeout(deadline, self.wait_idle()).await.is_err() {
            warn!(
                open_streams = self.open_streams(),
                deadline_secs = deadline.as_secs(),
                "Drain deadline passed, abandoning open streams"
            );
        }
        self.close();
        self.closed().await;
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.open_streams() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Execute a request over this session.
    ///
    /// The request URI must be absolute (scheme and authority set) and must not
    /// carry connection-specific headers. The response body streams from the
    /// backend; dropping it cancels the backend stream.
    pub async fn send_request<B>(&self, request: Request<B>) -> Result<Response<RelayBody>, SessionError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send,
    {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        // Count first: a drain that saw zero streams has already set draining
        let guard = StreamGuard::new(self.clone());
        if self.is_draining() {
            return Err(SessionError::Draining);
        }

        let (parts, body) = request.into_parts();
        let end_of_stream = body.is_end_stream();

        let mut sender = self.inner.sender.clone().ready().await?;
        let (response, stream) = sender.send_request(Request::from_parts(parts, ()), end_of_stream)?;

        let upload = if end_of_stream {
            None
        } else {
            Some(AbortOnDrop(tokio::spawn(stream_request_body(body, stream))))
        };

        let (parts, recv) = response.await?.into_parts();
        let body = SessionBody {
            recv,
            data_done: false,
            finished: false,
            _upload: upload,
            _guard: guard,
        };

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.is_closed())
            .field("draining", &self.is_draining())
            .field("open_streams", &self.open_streams())
            .finish()
    }
}

/// Counts an exchange as open for the drain logic
struct StreamGuard {
    session: Session,
}

impl StreamGuard {
    fn new(session: Session) -> Self {
        session.inner.open_streams.fetch_add(1, Ordering::SeqCst);
        Self { session }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.session.inner.open_streams.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.session.inner.idle.notify_waiters();
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn stream_request_body<B>(body: B, mut stream: SendStream<Bytes>)
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    let mut body = std::pin::pin!(body);
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                let e: BoxError = e.into();
                debug!(error = %e, "Request body failed, resetting backend stream");
                stream.send_reset(Reason::CANCEL);
                return;
            }
        };

        match frame.into_data() {
            Ok(data) => {
                if let Err(e) = send_data(&mut stream, data).await {
                    debug!(error = %e, "Failed to stream request body to backend");
                    return;
                }
            }
            Err(frame) => {
                if let Ok(trailers) = frame.into_trailers() {
                    if let Err(e) = stream.send_trailers(trailers) {
                        debug!(error = %e, "Failed to send request trailers to backend");
                    }
                    return;
                }
            }
        }
    }

    if let Err(e) = stream.send_data(Bytes::new(), true) {
        debug!(error = %e, "Failed to end request body stream");
    }
}

/// Send `data` respecting HTTP/2 flow control
async fn send_data(stream: &mut SendStream<Bytes>, mut data: Bytes) -> Result<(), h2::Error> {
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let capacity = match poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(capacity) => capacity?,
            None => return Err(h2::Error::from(Reason::CANCEL)),
        };
        if capacity == 0 {
            continue;
        }
        let chunk = data.split_to(capacity.min(data.len()));
        stream.send_data(chunk, false)?;
    }
    Ok(())
}

/// Response body read from a backend stream
struct SessionBody {
    recv: RecvStream,
    data_done: bool,
    finished: bool,
    _upload: Option<AbortOnDrop>,
    _guard: StreamGuard,
}

impl Body for SessionBody {
    type Data = Bytes;
    type Error = h2::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }

        if !this.data_done {
            match ready!(this.recv.poll_data(cx)) {
                Some(Ok(data)) => {
                    let _ = this.recv.flow_control().release_capacity(data.len());
                    return Poll::Ready(Some(Ok(Frame::data(data))));
                }
                Some(Err(e)) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => this.data_done = true,
            }
        }

        let trailers = ready!(this.recv.poll_trailers(cx));
        this.finished = true;
        match trailers {
            Ok(Some(trailers)) => Poll::Ready(Some(Ok(Frame::trailers(trailers)))),
            Ok(None) => Poll::Ready(None),
            Err(e) => Poll::Ready(Some(Err(e))),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished || self.recv.is_end_stream()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use h2::server::SendResponse;
    use http_body_util::{Empty, Full};
    use hyper::header::{HeaderMap, HeaderValue};
    use hyper::StatusCode;
    use tokio::io::DuplexStream;

    pub(crate) fn fast_config() -> SessionConfig {
        SessionConfig {
            keepalive_interval: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(5),
        }
    }

    /// Serve HTTP/2 on `io`, answering every request with `handler`
    pub(crate) fn spawn_backend<F>(io: DuplexStream, handler: F) -> JoinHandle<()>
    where
        F: Fn(&Request<RecvStream>, Bytes) -> Response<Bytes> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            let mut connection = match h2::server::handshake(io).await {
                Ok(connection) => connection,
                Err(_) => return,
            };
            while let Some(Ok((request, mut respond))) = connection.accept().await {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let (parts, mut body) = request.into_parts();
                    let mut received = Vec::new();
                    while let Some(Ok(chunk)) = body.data().await {
                        let _ = body.flow_control().release_capacity(chunk.len());
                        received.extend_from_slice(&chunk);
                    }
                    let request = Request::from_parts(parts, body);
                    let (parts, payload) = handler(&request, Bytes::from(received)).into_parts();
                    let mut send = respond
                        .send_response(Response::from_parts(parts, ()), payload.is_empty())
                        .unwrap();
                    if !payload.is_empty() {
                        let _ = send.send_data(payload, true);
                    }
                });
            }
        })
    }

    /// Accept one request on `io`, then keep driving the connection
    async fn accept_one(io: DuplexStream) -> (Request<RecvStream>, SendResponse<Bytes>) {
        let mut connection = h2::server::handshake(io).await.unwrap();
        let accepted = connection.accept().await.unwrap().unwrap();
        tokio::spawn(async move { while connection.accept().await.is_some() {} });
        accepted
    }

    fn request(path: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .uri(format!("https://backend{}", path))
            .body(Empty::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_request_streams_response() {
        let (relay_io, backend_io) = tokio::io::duplex(64 * 1024);
        spawn_backend(backend_io, |req, _| {
            Response::builder()
                .status(StatusCode::OK)
                .header("x-path", req.uri().path())
                .body(Bytes::from_static(b"world"))
                .unwrap()
        });

        let session = Session::handshake(relay_io, &fast_config()).await.unwrap();
        let response = session.send_request(request("/hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-path").unwrap(), "/hello");
        assert_eq!(session.open_streams(), 1);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"world");
        assert_eq!(session.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_request_body_is_forwarded() {
        let (relay_io, backend_io) = tokio::io::duplex(64 * 1024);
        spawn_backend(backend_io, |_, body| {
            Response::builder().status(StatusCode::OK).body(body).unwrap()
        });

        let session = Session::handshake(relay_io, &fast_config()).await.unwrap();
        let payload = Bytes::from(vec![b'x'; 200 * 1024]);
        let req = Request::builder()
            .method("POST")
            .uri("https://backend/upload")
            .body(Full::new(payload.clone()))
            .unwrap();

        let response = session.send_request(req).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, payload);
    }

    #[tokio::test]
    async fn test_ping_succeeds_against_live_backend() {
        let (relay_io, backend_io) = tokio::io::duplex(64 * 1024);
        spawn_backend(backend_io, |_, _| Response::new(Bytes::new()));

        let session = Session::handshake(relay_io, &fast_config()).await.unwrap();
        session.ping(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_times_out_against_silent_peer() {
        let (relay_io, _backend_io) = tokio::io::duplex(64 * 1024);

        let session = Session::handshake(relay_io, &fast_config()).await.unwrap();
        let result = session.ping(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(SessionError::PingTimeout(_))));
    }

    #[tokio::test]
    async fn test_closed_resolves_when_backend_disconnects() {
        let (relay_io, backend_io) = tokio::io::duplex(64 * 1024);
        let backend = spawn_backend(backend_io, |_, _| Response::new(Bytes::new()));

        let session = Session::handshake(relay_io, &fast_config()).await.unwrap();
        session.ping(Duration::from_secs(2)).await.unwrap();
        assert!(!session.is_closed());

        backend.abort();
        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("session should observe the disconnect");
        assert!(session.is_closed());
        assert!(matches!(
            session.send_request(request("/")).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests_and_closes() {
        let (relay_io, backend_io) = tokio::io::duplex(64 * 1024);
        spawn_backend(backend_io, |_, _| Response::new(Bytes::new()));

        let session = Session::handshake(relay_io, &fast_config()).await.unwrap();
        session.shutdown(Duration::from_secs(1)).await;

        assert!(session.is_draining());
        assert!(session.is_closed());
        assert!(session.send_request(request("/")).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_open_streams() {
        let (relay_io, backend_io) = tokio::io::duplex(64 * 1024);
        spawn_backend(backend_io, |_, _| Response::new(Bytes::from_static(b"late")));

        let session = Session::handshake(relay_io, &fast_config()).await.unwrap();
        let response = session.send_request(request("/")).await.unwrap();
        assert_eq!(session.open_streams(), 1);

        let draining = session.clone();
        let drain = tokio::spawn(async move { draining.shutdown(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.is_draining());
        assert!(!session.is_closed());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"late");

        tokio::time::timeout(Duration::from_secs(2), drain)
            .await
            .expect("drain should finish once the stream is done")
            .unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_abandons_streams_after_deadline() {
        let (relay_io, backend_io) = tokio::io::duplex(64 * 1024);
        spawn_backend(backend_io, |_, _| Response::new(Bytes::from_static(b"held")));

        let session = Session::handshake(relay_io, &fast_config()).await.unwrap();
        let _held = session.send_request(request("/")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), session.shutdown(Duration::from_millis(100)))
            .await
            .expect("shutdown must respect its deadline");
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_dropping_response_resets_backend_stream() {
        let (relay_io, backend_io) = tokio::io::duplex(64 * 1024);
        let (reset_tx, reset_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (_request, mut respond) = accept_one(backend_io).await;
            let mut send = respond.send_response(Response::new(()), false).unwrap();
            send.send_data(Bytes::from_static(b"partial"), false).unwrap();
            let reset = poll_fn(|cx| send.poll_reset(cx)).await;
            let _ = reset_tx.send(reset.is_ok());
        });

        let session = Session::handshake(relay_io, &fast_config()).await.unwrap();
        let response = session.send_request(request("/stream")).await.unwrap();
        let mut body = response.into_body();
        let data = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(&data[..], b"partial");
        assert_eq!(session.open_streams(), 1);

        drop(body);
        assert_eq!(session.open_streams(), 0);

        let reset = tokio::time::timeout(Duration::from_secs(2), reset_rx)
            .await
            .expect("backend should see the stream reset")
            .unwrap();
        assert!(reset);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_response_trailers_are_forwarded() {
        let (relay_io, backend_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (_request, mut respond) = accept_one(backend_io).await;
            let mut send = respond.send_response(Response::new(()), false).unwrap();
            send.send_data(Bytes::from_static(b"payload"), false).unwrap();
            let mut trailers = HeaderMap::new();
            trailers.insert("grpc-status", HeaderValue::from_static("0"));
            send.send_trailers(trailers).unwrap();
        });

        let session = Session::handshake(relay_io, &fast_config()).await.unwrap();
        let response = session.send_request(request("/rpc")).await.unwrap();
        let collected = response.into_body().collect().await.unwrap();

        let trailers = collected.trailers().cloned().unwrap();
        assert_eq!(trailers.get("grpc-status").unwrap(), "0");
        assert_eq!(&collected.to_bytes()[..], b"payload");
    }

    #[tokio::test]
    async fn test_request_trailers_are_forwarded() {
        let (relay_io, backend_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (request, mut respond) = accept_one(backend_io).await;
            let mut body = request.into_body();
            let mut received = Vec::new();
            while let Some(chunk) = body.data().await {
                let chunk = chunk.unwrap();
                let _ = body.flow_control().release_capacity(chunk.len());
                received.extend_from_slice(&chunk);
            }
            let checksum = body
                .trailers()
                .await
                .unwrap()
                .and_then(|t| t.get("x-checksum").cloned())
                .unwrap_or(HeaderValue::from_static("missing"));

            let response = Response::builder().header("x-seen-checksum", checksum).body(()).unwrap();
            let mut send = respond.send_response(response, false).unwrap();
            send.send_data(Bytes::from(received), true).unwrap();
        });

        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", HeaderValue::from_static("abc123"));
        let body = Full::new(Bytes::from_static(b"upload")).with_trailers(async move { Some(Ok(trailers)) });
        let req = Request::builder()
            .method("POST")
            .uri("https://backend/upload")
            .header("te", "trailers")
            .body(body)
            .unwrap();

        let session = Session::handshake(relay_io, &fast_config()).await.unwrap();
        let response = session.send_request(req).await.unwrap();
        assert_eq!(response.headers().get("x-seen-checksum").unwrap(), "abc123");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"upload");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_requests_racing_shutdown_are_served_or_refused() {
        let (relay_io, backend_io) = tokio::io::duplex(256 * 1024);
        spawn_backend(backend_io, |_, _| Response::new(Bytes::from_static(b"ok")));
        let session = Session::handshake(relay_io, &fast_config()).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..32 {
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                match session.send_request(request(&format!("/{}", i))).await {
                    Ok(response) => {
                        let body = response.into_body().collect().await.unwrap().to_bytes();
                        assert_eq!(&body[..], b"ok");
                    }
                    Err(SessionError::Draining) | Err(SessionError::Closed) => {}
                    Err(e) => panic!("request {} failed mid-drain: {}", i, e),
                }
            }));
        }
        let draining = session.clone();
        let drain = tokio::spawn(async move { draining.shutdown(Duration::from_secs(5)).await });

        for task in tasks {
            task.await.unwrap();
        }
        drain.await.unwrap();
        assert!(session.is_closed());
        assert_eq!(session.open_streams(), 0);
    }
}
