//! The provider side of a tunnel.
//!
//! A provider dials the broker, upgrades the connection with [`connect`], then
//! hands the resulting transport and a tower service to [`serve`]. Each
//! tunnelled request is handed to the service on its own task, and the response
//! is streamed back as frames.

use std::collections::HashMap;
use std::future::Future;

use bytes::Bytes;
use futures_util::StreamExt as _;
use http::header::{CONNECTION, HOST, UPGRADE};
use http::{Method, StatusCode, Uri};
use http_body_util::BodyExt as _;
use hyper::upgrade::Upgraded;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::AbortHandle;
use tower::ServiceExt as _;
use tracing::Instrument as _;

use crate::body::{Body, BodySender, Request};
use crate::bridge::io::TokioIo;
use crate::channel::{ChannelError, ProviderChannel};
use crate::config::TunnelConfig;
use crate::frame::{Frame, RequestId};
use crate::registry::SessionId;
use crate::transport::{FramedIo, Transport};
use crate::tunnel::strip_hop_by_hop;
use crate::BoxError;

const RESPONSE_CHUNK_SIZE: usize = 64 * 1024;

/// The transport produced by a provider handshake.
pub type ProviderTransport = FramedIo<TokioIo<Upgraded>>;

/// Error dialing the broker.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The HTTP exchange failed.
    #[error(transparent)]
    Http(#[from] hyper::Error),

    /// The upgrade request could not be built.
    #[error("invalid handshake request: {0}")]
    Request(#[from] http::Error),

    /// The broker refused the upgrade.
    #[error("broker refused the connection: {0}")]
    Rejected(StatusCode),
}

/// Connect to the broker as the provider for `session`, using the default
/// configuration.
pub async fn connect<IO>(io: IO, session: &str) -> Result<ProviderTransport, HandshakeError>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    connect_with_config(io, session, &TunnelConfig::default()).await
}

/// Connect to the broker as the provider for `session`.
///
/// Performs the HTTP/1.1 upgrade handshake over `io` and returns the upgraded
/// connection as a message transport. `config` must agree with the broker's
/// provider prefix and upgrade protocol.
#[tracing::instrument(skip_all, fields(session = %session))]
pub async fn connect_with_config<IO>(
    io: IO,
    session: &str,
    config: &TunnelConfig,
) -> Result<ProviderTransport, HandshakeError>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(error) = conn.with_upgrades().await {
            tracing::debug!(%error, "handshake connection failed");
        }
    });

    let request = http::Request::builder()
        .method(Method::GET)
        .uri(format!("{}/{}", config.provider_prefix, session))
        .header(HOST, "localhost")
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, config.upgrade_protocol.as_str())
        .body(http_body_util::Empty::<Bytes>::new())?;

    let response = sender.send_request(request).await?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        tracing::debug!(status = %response.status(), "upgrade refused");
        return Err(HandshakeError::Rejected(response.status()));
    }

    let upgraded = hyper::upgrade::on(response).await?;
    tracing::debug!("connected to broker");
    Ok(FramedIo::new(TokioIo::new(upgraded)).with_max_frame_size(config.max_frame_size))
}

struct InFlight {
    body: Option<BodySender>,
    task: AbortHandle,
}

/// Serve tunnelled requests for `session` with `service` until the broker goes
/// away.
///
/// Requests run concurrently. A service error is reported to the broker as an
/// `error` frame; a `cancel` frame from the broker aborts the request's task.
pub async fn serve<T, S, B>(session: impl Into<SessionId>, transport: T, service: S)
where
    T: Transport,
    S: tower::Service<Request, Response = http::Response<B>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    let session = session.into();
    let span = tracing::debug_span!("provider", session = %session);
    run(session, transport, service).instrument(span).await
}

async fn run<T, S, B>(session: SessionId, transport: T, service: S)
where
    T: Transport,
    S: tower::Service<Request, Response = http::Response<B>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<BoxError>,
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    let (channel, mut frames) = ProviderChannel::new(session, transport);
    let mut inflight: HashMap<RequestId, InFlight> = HashMap::new();

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!("malformed frame from broker: {error}");
                continue;
            }
        };

        match frame {
            Frame::RequestHeader {
                req_id,
                method,
                path,
                headers,
            } => {
                let uri = match path.parse::<Uri>() {
                    Ok(uri) => uri,
                    Err(error) => {
                        tracing::debug!(%req_id, %error, "invalid request path");
                        let message = format!("invalid request path: {error}");
                        spawn_notice(&channel, Frame::Error { req_id, message });
                        continue;
                    }
                };

                let (body_tx, body) = Body::channel();
                let mut request = http::Request::new(body);
                *request.method_mut() = method;
                *request.uri_mut() = uri;
                *request.headers_mut() = headers;

                let call = service.clone().oneshot(request);
                let task = tokio::spawn(respond(channel.clone(), req_id, call)).abort_handle();
                let previous = inflight.insert(
                    req_id,
                    InFlight {
                        body: Some(body_tx),
                        task,
                    },
                );
                if let Some(previous) = previous {
                    tracing::debug!(%req_id, "request id reused, dropping the earlier request");
                    previous.task.abort();
                }
            }
            Frame::RequestBodyChunk { req_id, bytes } => {
                if let Some(body) = inflight.get(&req_id).and_then(|req| req.body.as_ref()) {
                    // The service may have stopped reading; that is its business.
                    let _ = body.send_data(bytes);
                }
            }
            Frame::RequestBodyEnd { req_id } => {
                if let Some(request) = inflight.get_mut(&req_id) {
                    request.body.take();
                }
            }
            Frame::Cancel { req_id } => {
                if let Some(request) = inflight.remove(&req_id) {
                    tracing::debug!(%req_id, "request cancelled by broker");
                    request.task.abort();
                }
            }
            Frame::Ping => spawn_notice(&channel, Frame::Pong),
            Frame::Pong => {}
            other => {
                tracing::warn!(frame = other.name(), "unexpected frame from broker");
            }
        }

        inflight.retain(|_, request| !request.task.is_finished());
    }

    tracing::debug!(inflight = inflight.len(), "broker connection closed");
    for request in inflight.into_values() {
        request.task.abort();
    }
    channel.shutdown().await;
}

fn spawn_notice(channel: &std::sync::Arc<ProviderChannel>, frame: Frame) {
    let channel = channel.clone();
    tokio::spawn(async move {
        if let Err(error) = channel.send(&frame).await {
            tracing::trace!(frame = frame.name(), %error, "notice not sent");
        }
    });
}

async fn respond<F, B, E>(channel: std::sync::Arc<ProviderChannel>, req_id: RequestId, call: F)
where
    F: Future<Output = Result<http::Response<B>, E>>,
    E: Into<BoxError>,
    B: http_body::Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let result = match call.await.map_err(Into::<BoxError>::into) {
        Ok(response) => send_response(&channel, req_id, response).await,
        Err(error) => {
            tracing::debug!(%req_id, %error, "service failed");
            channel
                .send(&Frame::Error {
                    req_id,
                    message: error.to_string(),
                })
                .await
        }
    };

    match result {
        Ok(()) => {}
        Err(ChannelError::FrameTooLarge { size, limit }) => {
            tracing::debug!(%req_id, size, limit, "response frame too large");
            let message = format!("response frame of {size} bytes exceeds the limit of {limit} bytes");
            if let Err(error) = channel.send(&Frame::Error { req_id, message }).await {
                tracing::debug!(%req_id, %error, "response not delivered");
            }
        }
        Err(error) => {
            tracing::debug!(%req_id, %error, "response not delivered");
        }
    }
}

async fn send_response<B>(
    channel: &ProviderChannel,
    req_id: RequestId,
    response: http::Response<B>,
) -> Result<(), ChannelError>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);

    channel
        .send(&Frame::ResponseHeader {
            req_id,
            status: parts.status,
            headers,
        })
        .await?;

    let mut body = Box::pin(body);
    while let Some(frame) = body.frame().await {
        let frame = match frame.map_err(Into::<BoxError>::into) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::debug!(%req_id, %error, "response body failed");
                let message = format!("response body failed: {error}");
                return channel.send(&Frame::Error { req_id, message }).await;
            }
        };

        let Ok(mut data) = frame.into_data() else {
            continue;
        };
        while !data.is_empty() {
            let bytes = data.split_to(RESPONSE_CHUNK_SIZE.min(data.len()));
            channel
                .send(&Frame::ResponseBodyChunk { req_id, bytes })
                .await?;
        }
    }

    channel.send(&Frame::ResponseBodyEnd { req_id }).await
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::convert::Infallible;

    use crate::transport;

    async fn echo(req: Request) -> Result<http::Response<Body>, Infallible> {
        let path = req.uri().path().to_owned();
        let body = req.into_body().collect().await.unwrap().to_bytes();
        let mut response = http::Response::new(Body::from(format!("{path}:{}", body.len())));
        response
            .headers_mut()
            .insert("x-echo", http::HeaderValue::from_static("yes"));
        Ok(response)
    }

    #[tokio::test]
    async fn serves_tunnelled_requests() {
        let (broker, provider) = transport::duplex(64 * 1024);
        tokio::spawn(serve("s1", provider, tower::service_fn(echo)));

        let (channel, mut frames) = ProviderChannel::new("s1".into(), broker);
        let req_id = RequestId::new(3);
        let mut writer = channel.writer().await;
        writer
            .send(&Frame::RequestHeader {
                req_id,
                method: Method::POST,
                path: "/upload".into(),
                headers: http::HeaderMap::new(),
            })
            .await
            .unwrap();
        writer
            .send(&Frame::RequestBodyChunk {
                req_id,
                bytes: Bytes::from_static(b"abcd"),
            })
            .await
            .unwrap();
        writer.send(&Frame::RequestBodyEnd { req_id }).await.unwrap();
        drop(writer);

        let Frame::ResponseHeader {
            req_id: id,
            status,
            headers,
        } = frames.next().await.unwrap().unwrap()
        else {
            panic!("expected a response header");
        };
        assert_eq!(id, req_id);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-echo"], "yes");

        assert_eq!(
            frames.next().await.unwrap().unwrap(),
            Frame::ResponseBodyChunk {
                req_id,
                bytes: Bytes::from_static(b"/upload:4"),
            }
        );
        assert_eq!(
            frames.next().await.unwrap().unwrap(),
            Frame::ResponseBodyEnd { req_id }
        );
    }

    #[tokio::test]
    async fn service_errors_become_error_frames() {
        let (broker, provider) = transport::duplex(64 * 1024);
        let failing = tower::service_fn(|_: Request| async {
            Err::<http::Response<Body>, BoxError>("backend down".into())
        });
        tokio::spawn(serve("s1", provider, failing));

        let (channel, mut frames) = ProviderChannel::new("s1".into(), broker);
        let req_id = RequestId::new(1);
        channel
            .send(&Frame::RequestHeader {
                req_id,
                method: Method::GET,
                path: "/".into(),
                headers: http::HeaderMap::new(),
            })
            .await
            .unwrap();

        assert_eq!(
            frames.next().await.unwrap().unwrap(),
            Frame::Error {
                req_id,
                message: "backend down".into(),
            }
        );
    }

    #[tokio::test]
    async fn answers_pings() {
        let (broker, provider) = transport::duplex(1024);
        tokio::spawn(serve("s1", provider, tower::service_fn(echo)));

        let (channel, mut frames) = ProviderChannel::new("s1".into(), broker);
        channel.send(&Frame::Ping).await.unwrap();
        assert_eq!(frames.next().await.unwrap().unwrap(), Frame::Pong);
    }
}
