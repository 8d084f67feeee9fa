#![allow(missing_docs)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use backhaul::bridge::io::TokioIo;
use backhaul::body::Request;
use backhaul::registry::SessionEvent;
use backhaul::{provider, Body, Server, Tunnel};
use bytes::Bytes;
use http::StatusCode;
use http_body_util::BodyExt as _;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn echo(req: Request) -> Result<http::Response<Body>, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let body = req.into_body().collect().await.unwrap().to_bytes();

    let reply = format!("{method} {uri} {}", String::from_utf8_lossy(&body));
    Ok(http::Response::builder()
        .status(StatusCode::OK)
        .header("x-provider", "echo")
        .body(Body::from(reply))
        .unwrap())
}

struct Broker {
    addr: SocketAddr,
    tunnel: Tunnel,
    shutdown: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<Result<(), backhaul::server::ServerError>>,
}

async fn broker() -> Broker {
    init_tracing();
    let mut tunnel = Tunnel::new();
    tunnel.set_keepalive(None);

    let server = Server::bind("127.0.0.1:0", tunnel.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown, rx) = oneshot::channel();
    let handle = tokio::spawn(server.with_graceful_shutdown(async {
        let _ = rx.await;
    }));

    Broker {
        addr,
        tunnel,
        shutdown,
        handle,
    }
}

async fn connect_provider(broker: &Broker, session: &str) -> tokio::task::JoinHandle<()> {
    let mut observer = broker.tunnel.registry().register_renter_observer(session);

    let stream = TcpStream::connect(broker.addr).await.unwrap();
    let transport = provider::connect(stream, session).await.unwrap();
    let handle = tokio::spawn(provider::serve(
        session.to_owned(),
        transport,
        tower::service_fn(echo),
    ));

    let event = tokio::time::timeout(TIMEOUT, observer.next_event())
        .await
        .unwrap();
    assert_eq!(event, Some(SessionEvent::ProviderConnected));
    handle
}

async fn request(
    addr: SocketAddr,
    req: http::Request<http_body_util::Full<Bytes>>,
) -> (StatusCode, http::HeaderMap, Bytes) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let response = tokio::time::timeout(TIMEOUT, sender.send_request(req))
        .await
        .unwrap()
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

fn get(uri: &str) -> http::Request<http_body_util::Full<Bytes>> {
    http::Request::get(uri)
        .header(http::header::HOST, "broker")
        .body(http_body_util::Full::default())
        .unwrap()
}

#[tokio::test]
async fn renter_reaches_provider_through_broker() {
    let broker = broker().await;
    let _provider = connect_provider(&broker, "s1").await;

    let (status, headers, body) = request(broker.addr, get("/session/s1/status?verbose=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-provider"], "echo");
    assert_eq!(&*body, b"GET /status?verbose=1 ");

    let post = http::Request::post("/session/s1/items")
        .header(http::header::HOST, "broker")
        .body(http_body_util::Full::new(Bytes::from_static(b"payload")))
        .unwrap();
    let (status, _, body) = request(broker.addr, post).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&*body, b"POST /items payload");

    let _ = broker.shutdown.send(());
    broker.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn sessions_are_issued_and_usable() {
    let broker = broker().await;

    let create = http::Request::post("/sessions")
        .header(http::header::HOST, "broker")
        .body(http_body_util::Full::default())
        .unwrap();
    let (status, _, body) = request(broker.addr, create).await;
    assert_eq!(status, StatusCode::CREATED);
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let session = value["session_id"].as_str().unwrap().to_owned();

    let (status, _, _) = request(broker.addr, get(&format!("/session/{session}/"))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let _provider = connect_provider(&broker, &session).await;
    let (status, _, body) = request(broker.addr, get(&format!("/session/{session}/"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&*body, b"GET / ");
}

#[tokio::test]
async fn unknown_routes_and_plain_provider_requests() {
    let broker = broker().await;

    let (status, _, _) = request(broker.addr, get("/nowhere")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = request(broker.addr, get("/provider/s1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn provider_disconnect_leaves_session_unavailable() {
    let broker = broker().await;
    let provider = connect_provider(&broker, "s1").await;
    let mut observer = broker.tunnel.registry().register_renter_observer("s1");

    provider.abort();
    let event = tokio::time::timeout(TIMEOUT, observer.next_event())
        .await
        .unwrap();
    assert_eq!(event, Some(SessionEvent::ProviderDisconnected));

    let (status, _, _) = request(broker.addr, get("/session/s1/status")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn shutdown_closes_provider_channels() {
    let broker = broker().await;
    let provider = connect_provider(&broker, "s1").await;

    let _ = broker.shutdown.send(());
    tokio::time::timeout(TIMEOUT, broker.handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // The provider sees the broker hang up and returns.
    tokio::time::timeout(TIMEOUT, provider)
        .await
        .unwrap()
        .unwrap();
}
