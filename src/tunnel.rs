//! Tunnel ingress: the entry point for renter requests, and the dispatch task
//! which routes provider replies back to them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt as _;
use http::header::{HeaderName, CONNECTION};
use http::HeaderMap;
use http_body_util::BodyExt as _;
use tracing::Instrument as _;

use crate::body::Response;
use crate::channel::{ChannelError, FrameStream, ProviderChannel};
use crate::config::TunnelConfig;
use crate::correlator::{CorrelationError, Correlator};
use crate::error::TunnelError;
use crate::frame::{Frame, RequestId};
use crate::registry::{Session, SessionId, SessionRegistry};
use crate::transport::Transport;
use crate::BoxError;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Forwards renter requests to providers and routes their replies back.
///
/// Cloning a `Tunnel` is cheap; clones share the same registry.
#[derive(Clone, Default)]
pub struct Tunnel {
    registry: SessionRegistry,
    config: Arc<TunnelConfig>,
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("sessions", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Tunnel {
    /// Create a tunnel with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tunnel with the given configuration.
    pub fn new_with_config(config: TunnelConfig) -> Self {
        Self {
            registry: SessionRegistry::new(),
            config: Arc::new(config),
        }
    }

    /// The session registry behind this tunnel.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The tunnel configuration.
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    #[inline]
    fn config_mut(&mut self) -> &mut TunnelConfig {
        Arc::make_mut(&mut self.config)
    }

    /// Set how long a forwarded request may take to complete.
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.config_mut().request_timeout = timeout;
    }

    /// Set the idle period after which a keepalive ping is sent. `None`
    /// disables keepalives.
    pub fn set_keepalive(&mut self, keepalive: Option<Duration>) {
        self.config_mut().keepalive = keepalive;
    }

    /// Set how many protocol violations a provider channel may commit before it
    /// is closed.
    pub fn set_malformed_threshold(&mut self, threshold: usize) {
        self.config_mut().malformed_threshold = threshold;
    }

    /// Forward a renter request to the provider for `session`.
    ///
    /// The request's path and query are passed to the provider verbatim, so
    /// callers strip any session prefix first. The response head resolves this
    /// future; the response body keeps streaming from the provider afterwards.
    ///
    /// When no provider is connected this fails immediately with
    /// [`TunnelError::ProviderUnavailable`]. Dropping the future before the
    /// response head arrives cancels the request, and the provider is told so.
    ///
    /// The request's frames are written while holding the channel's write lock,
    /// so a renter which uploads slowly delays every other request on the
    /// session, at most until its own deadline. A response head which arrives
    /// before the upload is complete resolves this future at once, and the rest
    /// of the body is sent in the background.
    #[tracing::instrument(skip_all, fields(session = %session, req_id = tracing::field::Empty))]
    pub async fn forward<B>(
        &self,
        session: &str,
        request: http::Request<B>,
    ) -> Result<Response, TunnelError>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError> + Send,
    {
        let Some(entry) = self.registry.session(session) else {
            tracing::debug!("no provider connected");
            return Err(TunnelError::ProviderUnavailable(session.into()));
        };

        let correlator = entry.correlator().clone();
        let channel = entry.channel().clone();
        let (req_id, mut response) = correlator.begin(self.config.request_timeout)?;
        tracing::Span::current().record("req_id", req_id.get());

        let mut guard = CancelOnDrop {
            correlator: correlator.clone(),
            channel: channel.clone(),
            req_id,
            armed: true,
        };

        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_owned();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        let header = Frame::RequestHeader {
            req_id,
            method: parts.method,
            path,
            headers,
        };

        let mut sending = Box::pin(send_request(
            channel.clone(),
            req_id,
            header,
            body,
            self.config.chunk_size(),
        ));
        let sent = tokio::select! {
            biased;
            early = &mut response => {
                guard.disarm();
                match &early {
                    // The provider answered before the upload finished; the
                    // rest of the body still goes out.
                    Ok(_) => {
                        tokio::spawn(
                            drain_request(sending, correlator.clone(), channel.clone(), req_id)
                                .in_current_span(),
                        );
                    }
                    Err(TunnelError::ProviderDisconnected | TunnelError::ProviderReplaced) => {}
                    // The provider holds a partial request.
                    Err(_) => {
                        drop(sending);
                        notify(&channel, Frame::Cancel { req_id });
                    }
                }
                return finish(early);
            }
            sent = &mut sending => sent,
        };

        match sent {
            Ok(()) => {
                correlator.mark_sent(req_id);
                tracing::trace!("request sent");
            }
            Err(SendError::Channel(ChannelError::FrameTooLarge { size, limit })) => {
                tracing::debug!(size, limit, "request frame too large");
                // The guard cancels the request and tells the provider.
                return Err(TunnelError::RequestTooLarge { size, limit });
            }
            Err(SendError::Channel(error)) => {
                tracing::debug!(%error, "failed to send request");
                correlator.fail(req_id, TunnelError::ProviderDisconnected);
            }
            Err(SendError::Body(error)) => {
                tracing::debug!(%error, "request body failed");
                // The guard cancels the request and tells the provider.
                return Err(TunnelError::Cancelled);
            }
        }

        let result = response.await;
        guard.disarm();
        finish(result)
    }

    /// Attach a provider connection to `session`.
    ///
    /// The transport becomes the session's channel, replacing any previous one,
    /// and a task is spawned to dispatch its frames until it closes. Must be
    /// called within a tokio runtime.
    pub fn attach_provider<T>(&self, session: impl Into<SessionId>, transport: T) -> Session
    where
        T: Transport,
    {
        let session = session.into();
        let (channel, frames) =
            ProviderChannel::with_max_frame_size(session.clone(), transport, self.config.max_frame_size);
        let span = tracing::debug_span!("dispatch", session = %session, channel = %channel.id());
        let entry = self.registry.register_provider(session, channel);

        let dispatch = Dispatch {
            registry: self.registry.clone(),
            session: entry.clone(),
            config: self.config.clone(),
            violations: 0,
        };
        tokio::spawn(dispatch.run(frames).instrument(span));

        entry
    }
}

fn finish(result: Result<Response, TunnelError>) -> Result<Response, TunnelError> {
    let mut response = result?;
    strip_hop_by_hop(response.headers_mut());
    tracing::trace!(status = %response.status(), "response head received");
    Ok(response)
}

#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("request body: {0}")]
    Body(#[source] BoxError),
}

/// Finish uploading a request whose response head has already arrived.
async fn drain_request<F>(
    sending: F,
    correlator: Arc<Correlator>,
    channel: Arc<ProviderChannel>,
    req_id: RequestId,
) where
    F: std::future::Future<Output = Result<(), SendError>>,
{
    match sending.await {
        Ok(()) => {
            correlator.mark_sent(req_id);
            tracing::trace!("request sent after response head");
        }
        Err(SendError::Channel(ChannelError::Closed | ChannelError::Transport(_))) => {
            tracing::trace!("channel went away while sending");
        }
        Err(error) => {
            tracing::debug!(%error, "request upload failed after response head");
            correlator.fail(req_id, TunnelError::Cancelled);
            notify(&channel, Frame::Cancel { req_id });
        }
    }
}

async fn send_request<B>(
    channel: Arc<ProviderChannel>,
    req_id: RequestId,
    header: Frame,
    body: B,
    chunk_size: usize,
) -> Result<(), SendError>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let mut writer = channel.writer().await;
    writer.send(&header).await?;

    let mut body = Box::pin(body);
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|error| SendError::Body(error.into()))?;
        // Trailers are not forwarded.
        let Ok(mut data) = frame.into_data() else {
            continue;
        };

        while !data.is_empty() {
            let bytes = data.split_to(chunk_size.min(data.len()));
            writer
                .send(&Frame::RequestBodyChunk { req_id, bytes })
                .await?;
        }
    }

    writer.send(&Frame::RequestBodyEnd { req_id }).await?;
    Ok(())
}

/// Send a notice to the provider without waiting for the channel.
fn notify(channel: &Arc<ProviderChannel>, frame: Frame) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };

    let channel = channel.clone();
    handle.spawn(async move {
        if let Err(error) = channel.send(&frame).await {
            tracing::trace!(channel = %channel.id(), frame = frame.name(), %error, "notice not sent");
        }
    });
}

/// Cancels a pending request if the renter goes away before its response head
/// arrives.
struct CancelOnDrop {
    correlator: Arc<Correlator>,
    channel: Arc<ProviderChannel>,
    req_id: RequestId,
    armed: bool,
}

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed && self.correlator.cancel(self.req_id) {
            notify(
                &self.channel,
                Frame::Cancel {
                    req_id: self.req_id,
                },
            );
        }
    }
}

/// Routes frames from one provider channel to its session's correlator.
struct Dispatch {
    registry: SessionRegistry,
    session: Session,
    config: Arc<TunnelConfig>,
    violations: usize,
}

impl Dispatch {
    async fn run(mut self, mut frames: FrameStream) {
        let channel = self.session.channel().clone();
        let watched = channel.clone();
        let closed = watched.closed();
        tokio::pin!(closed);

        let mut keepalive = self.config.keepalive.filter(|period| !period.is_zero()).map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        tracing::debug!("provider attached");
        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => self.route(frame),
                    Some(Err(error)) => self.violation(&error),
                    None => {
                        tracing::debug!("provider transport closed");
                        break;
                    }
                },
                _ = &mut closed => {
                    tracing::debug!("provider channel closed");
                    break;
                }
                _ = tick(&mut keepalive) => self.keepalive(),
            }

            if self.violations > self.config.malformed_threshold {
                tracing::warn!(
                    violations = self.violations,
                    "too many protocol violations, closing provider channel"
                );
                break;
            }
        }

        self.teardown(channel).await;
    }

    fn route(&mut self, frame: Frame) {
        let correlator = self.session.correlator().clone();
        let result = match frame {
            Frame::ResponseHeader {
                req_id,
                status,
                mut headers,
            } => {
                strip_hop_by_hop(&mut headers);
                correlator.on_response_header(req_id, status, headers)
            }
            Frame::ResponseBodyChunk { req_id, bytes } => {
                correlator.on_response_body_chunk(req_id, bytes)
            }
            Frame::ResponseBodyEnd { req_id } => correlator.on_response_body_end(req_id),
            Frame::Error { req_id, message } => correlator.on_provider_error(req_id, message),
            Frame::Ping => {
                notify(self.session.channel(), Frame::Pong);
                Ok(())
            }
            Frame::Pong => Ok(()),
            Frame::RequestHeader { .. }
            | Frame::RequestBodyChunk { .. }
            | Frame::RequestBodyEnd { .. }
            | Frame::Cancel { .. } => {
                let error = format!("unexpected {} frame from provider", frame.name());
                self.violation(&error);
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(CorrelationError::UnknownRequest(req_id)) => {
                tracing::debug!(%req_id, "dropping frame for unknown request");
            }
            Err(CorrelationError::Abandoned(req_id)) => {
                tracing::debug!(%req_id, "renter went away, cancelling");
                notify(self.session.channel(), Frame::Cancel { req_id });
            }
            Err(error @ CorrelationError::OutOfOrder { .. }) => self.violation(&error),
        }
    }

    fn violation(&mut self, error: &dyn fmt::Display) {
        self.violations += 1;
        tracing::warn!(violations = self.violations, "protocol violation: {error}");
    }

    fn keepalive(&self) {
        let Some(period) = self.config.keepalive else {
            return;
        };
        let channel = self.session.channel();
        if channel.idle_for() >= period {
            tracing::trace!("sending keepalive");
            notify(channel, Frame::Ping);
        }
    }

    async fn teardown(self, channel: Arc<ProviderChannel>) {
        channel.close();
        let removed = self
            .registry
            .unregister_provider(self.session.id().as_str(), &channel);
        let failed = self.session.correlator().on_channel_closed();
        tracing::debug!(removed, failed, "provider detached");
        channel.shutdown().await;
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
