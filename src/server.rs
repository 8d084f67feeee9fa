//! The broker's HTTP surface.
//!
//! Three kinds of request arrive here:
//!
//! - `POST /sessions` issues a fresh session id.
//! - `GET {provider_prefix}/{id}` with `Connection: upgrade` and
//!   `Upgrade: {upgrade_protocol}` is a provider dialing in. The connection is
//!   upgraded and becomes the session's provider channel.
//! - Anything under `{session_prefix}/{id}/` is a renter request, forwarded to
//!   the session's provider with the prefix and id removed.
//!
//! Everything else is a 404.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::pin;
use std::task::{Context, Poll};

use http::header::{CONNECTION, CONTENT_TYPE, UPGRADE};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use hyper::server::conn::http1;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, trace, Instrument as _};

use crate::body::{Body, Request, Response};
use crate::bridge::io::TokioIo;
use crate::bridge::service::HyperService;
use crate::transport::FramedIo;
use crate::tunnel::Tunnel;
use crate::{BoxError, BoxFuture};

/// Routes broker requests: session issuance, provider upgrades, and renter
/// traffic.
#[derive(Debug, Clone)]
pub struct BrokerService {
    tunnel: Tunnel,
}

impl BrokerService {
    /// Create a service routing into `tunnel`.
    pub fn new(tunnel: Tunnel) -> Self {
        Self { tunnel }
    }
}

impl tower::Service<Request> for BrokerService {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let tunnel = self.tunnel.clone();
        Box::pin(async move { Ok(route(tunnel, req).await) })
    }
}

async fn route(tunnel: Tunnel, req: Request) -> Response {
    let config = tunnel.config();
    let path = req.uri().path().to_owned();

    if path == "/sessions" {
        return if req.method() == Method::POST {
            create_session()
        } else {
            plain(StatusCode::METHOD_NOT_ALLOWED, "use POST to create a session")
        };
    }

    if let Some(id) = strip_segment(&path, &config.provider_prefix) {
        if !id.contains('/') {
            let id = id.to_owned();
            return accept_provider(&tunnel, id, req);
        }
    }

    if let Some(rest) = strip_segment(&path, &config.session_prefix) {
        let (id, remainder) = match rest.split_once('/') {
            Some((id, remainder)) => (id.to_owned(), format!("/{remainder}")),
            None => (rest.to_owned(), "/".to_owned()),
        };
        return forward(&tunnel, &id, &remainder, req).await;
    }

    trace!(%path, "no route");
    plain(StatusCode::NOT_FOUND, "not found")
}

/// `/prefix/rest` → `rest`, if `rest` is not empty.
fn strip_segment<'p>(path: &'p str, prefix: &str) -> Option<&'p str> {
    path.strip_prefix(prefix)?
        .strip_prefix('/')
        .filter(|rest| !rest.is_empty())
}

fn create_session() -> Response {
    let id = uuid::Uuid::new_v4().simple().to_string();
    debug!(session = %id, "issued session id");

    let body = serde_json::json!({ "session_id": id }).to_string();
    let mut response = http::Response::new(Body::from(body));
    *response.status_mut() = StatusCode::CREATED;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

async fn forward(tunnel: &Tunnel, session: &str, remainder: &str, mut req: Request) -> Response {
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{remainder}?{query}"),
        None => remainder.to_owned(),
    };

    match path_and_query.parse::<Uri>() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(error) => {
            debug!(%error, "unforwardable path");
            return plain(StatusCode::BAD_REQUEST, "invalid path");
        }
    }

    match tunnel.forward(session, req).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

fn accept_provider(tunnel: &Tunnel, session: String, mut req: Request) -> Response {
    let protocol = tunnel.config().upgrade_protocol.clone();
    if !wants_upgrade(req.headers(), &protocol) {
        debug!(%session, "provider connection without upgrade");
        return plain(
            StatusCode::BAD_REQUEST,
            "provider connections must upgrade to the tunnel protocol",
        );
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    let tunnel = tunnel.clone();
    let span = tracing::debug_span!("upgrade", session = %session);
    tokio::spawn(
        async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let transport = FramedIo::new(TokioIo::new(upgraded))
                        .with_max_frame_size(tunnel.config().max_frame_size);
                    tunnel.attach_provider(session, transport);
                }
                Err(error) => debug!(%error, "provider upgrade failed"),
            }
        }
        .instrument(span),
    );

    let mut response = http::Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("upgrade"));
    if let Ok(value) = HeaderValue::from_str(&protocol) {
        response.headers_mut().insert(UPGRADE, value);
    }
    response
}

fn wants_upgrade(headers: &HeaderMap, protocol: &str) -> bool {
    let connection = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    let upgrade = headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case(protocol));

    connection && upgrade
}

fn plain(status: StatusCode, message: &'static str) -> Response {
    let mut response = http::Response::new(Body::from(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// An HTTP/1.1 broker server.
pub struct Server {
    listener: TcpListener,
    tunnel: Tunnel,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.listener.local_addr().ok())
            .field("tunnel", &self.tunnel)
            .finish()
    }
}

impl Server {
    /// Bind a listener and serve `tunnel` on it.
    pub async fn bind<A>(addr: A, tunnel: Tunnel) -> io::Result<Self>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener, tunnel))
    }

    /// Serve `tunnel` on an existing listener.
    pub fn new(listener: TcpListener, tunnel: Tunnel) -> Self {
        Self { listener, tunnel }
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The tunnel this server feeds.
    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    /// Accept connections until an error occurs.
    pub async fn serve(self) -> Result<(), ServerError> {
        self.with_graceful_shutdown(std::future::pending()).await
    }

    /// Accept connections until `signal` resolves, then stop accepting, close
    /// every provider channel, and wait for open renter connections to finish.
    pub async fn with_graceful_shutdown<F>(self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (finished, finished_rx) = watch::channel(());
        let mut signal = pin!(signal);

        debug!(addr = ?self.listener.local_addr().ok(), "broker listening");
        loop {
            let (stream, remote) = tokio::select! {
                _ = &mut signal => {
                    debug!("received shutdown signal");
                    break;
                }
                accepted = self.listener.accept() => accepted.map_err(ServerError::accept)?,
            };
            trace!(%remote, "accepted connection");

            let service = HyperService::new(BrokerService::new(self.tunnel.clone()));
            let conn = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();

            let mut shutdown_rx = shutdown_rx.clone();
            let finished_rx = finished_rx.clone();
            let span = tracing::trace_span!("connection", %remote);
            tokio::spawn(
                async move {
                    let mut conn = pin!(conn);
                    let stop = async {
                        let _ = shutdown_rx.wait_for(|stop| *stop).await;
                    };
                    let result = tokio::select! {
                        rv = conn.as_mut() => rv,
                        () = stop => {
                            debug!("connection received shutdown signal");
                            conn.as_mut().graceful_shutdown();
                            conn.await
                        }
                    };
                    if let Err(error) = result {
                        debug!("connection error: {error}");
                    }
                    drop(finished_rx);
                }
                .instrument(span),
            );
        }

        let _ = shutdown.send(true);
        drop(finished_rx);

        let closed = self.tunnel.registry().close_all();
        debug!(providers = closed, "closed provider channels");

        finished.closed().await;
        debug!("all connections closed");
        Ok(())
    }
}

/// An error that ends the accept loop.
///
/// Errors on individual connections are logged and never end the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Accepting a connection failed.
    #[error("accept error: {0}")]
    Accept(#[source] BoxError),

    /// I/O error on the listener.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServerError {
    fn accept<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        let boxed = error.into();
        debug!("accept error: {}", boxed);
        Self::Accept(boxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body_util::BodyExt as _;
    use tower::ServiceExt as _;

    async fn call(req: http::Request<Body>) -> Response {
        BrokerService::new(Tunnel::new())
            .oneshot(req)
            .await
            .unwrap()
    }

    fn request(method: Method, uri: &str) -> Request {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn segments() {
        assert_eq!(strip_segment("/session/s1/a/b", "/session"), Some("s1/a/b"));
        assert_eq!(strip_segment("/session/", "/session"), None);
        assert_eq!(strip_segment("/sessions", "/session"), None);
        assert_eq!(strip_segment("/provider/p", "/provider"), Some("p"));
    }

    #[test]
    fn upgrade_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "keep-alive, Upgrade".parse().unwrap());
        headers.insert(UPGRADE, "Backhaul".parse().unwrap());
        assert!(wants_upgrade(&headers, "backhaul"));
        assert!(!wants_upgrade(&headers, "websocket"));

        headers.remove(CONNECTION);
        assert!(!wants_upgrade(&headers, "backhaul"));
    }

    #[tokio::test]
    async fn issues_session_ids() {
        let response = call(request(Method::POST, "/sessions")).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id = value["session_id"].as_str().unwrap();
        assert_eq!(id.len(), 32);

        let response = call(request(Method::GET, "/sessions")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn renter_without_provider_gets_503() {
        let response = call(request(Method::GET, "/session/s2/anything?x=1")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn provider_must_upgrade() {
        let response = call(request(Method::GET, "/provider/s1")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_paths_are_404() {
        for uri in ["/", "/other", "/session", "/provider/a/b"] {
            let response = call(request(Method::GET, uri)).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }
}
