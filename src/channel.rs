//! A provider channel: one persistent connection to one provider.
//!
//! Writes are serialized through an async lock, so a caller holding a
//! [`ChannelWriter`] can emit a multi-frame sequence without frames from other
//! requests landing in the middle. Inbound traffic is exposed as a
//! [`FrameStream`], handed out once when the channel is created.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::frame::{self, Frame, Malformed};
use crate::registry::SessionId;
use crate::transport::{BoxTransport, Message, Transport, TransportError, DEFAULT_MAX_FRAME_SIZE};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a channel, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Error sending on a provider channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel has been closed.
    #[error("provider channel closed")]
    Closed,

    /// The frame does not fit in one message. Nothing was written and the
    /// channel stays open.
    #[error("frame of {size} bytes exceeds the limit of {limit} bytes")]
    FrameTooLarge {
        /// Encoded size of the frame.
        size: usize,
        /// Largest message the channel carries.
        limit: usize,
    },

    /// The transport failed; the channel is now closed.
    #[error("provider transport: {0}")]
    Transport(#[source] TransportError),
}

type Writer = SplitSink<BoxTransport, Message>;

#[derive(Debug)]
struct Activity(Mutex<Instant>);

impl Activity {
    fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    fn get(&self) -> Instant {
        *self.0.lock()
    }
}

/// One persistent connection to a provider.
pub struct ProviderChannel {
    id: ChannelId,
    session: SessionId,
    max_frame_size: usize,
    writer: tokio::sync::Mutex<Option<Writer>>,
    activity: Arc<Activity>,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for ProviderChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderChannel")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ProviderChannel {
    /// Wrap a transport to the provider of `session`.
    ///
    /// Returns the channel, which owns the write half, and the stream of inbound
    /// frames. The stream can only be consumed once: when it ends, the
    /// connection is gone.
    pub fn new<T>(session: SessionId, transport: T) -> (Arc<Self>, FrameStream)
    where
        T: Transport,
    {
        Self::with_max_frame_size(session, transport, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Wrap a transport which carries messages of at most `max_frame_size`
    /// bytes.
    ///
    /// Frames which would encode to a larger message are refused with
    /// [`ChannelError::FrameTooLarge`] before anything is written.
    pub fn with_max_frame_size<T>(
        session: SessionId,
        transport: T,
        max_frame_size: usize,
    ) -> (Arc<Self>, FrameStream)
    where
        T: Transport,
    {
        let transport: BoxTransport = Box::new(transport);
        let (writer, reader) = transport.split();
        let activity = Arc::new(Activity(Mutex::new(Instant::now())));
        let (closed, _) = watch::channel(false);

        let channel = Arc::new(Self {
            id: ChannelId::next(),
            session,
            max_frame_size,
            writer: tokio::sync::Mutex::new(Some(writer)),
            activity: activity.clone(),
            closed,
        });

        let frames = FrameStream {
            reader,
            activity,
            channel: channel.id,
            done: false,
        };

        (channel, frames)
    }

    /// Identity of this channel.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Session this channel serves.
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Largest message this channel sends.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// When traffic last moved over this channel, in either direction.
    pub fn last_activity(&self) -> Instant {
        self.activity.get()
    }

    /// Time since traffic last moved over this channel.
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.activity.get())
    }

    /// Send a single frame.
    pub async fn send(&self, frame: &Frame) -> Result<(), ChannelError> {
        self.writer().await.send(frame).await
    }

    /// Take exclusive write access to the channel.
    ///
    /// Frames sent through the returned writer are never interleaved with frames
    /// from other senders. Other senders wait until it is dropped.
    pub async fn writer(&self) -> ChannelWriter<'_> {
        ChannelWriter {
            sink: self.writer.lock().await,
            channel: self,
        }
    }

    /// Mark the channel closed.
    ///
    /// Returns `true` for the call which actually closed the channel, and `false`
    /// for every later call. Pending and future sends fail with
    /// [`ChannelError::Closed`], and [`closed`](Self::closed) resolves.
    pub fn close(&self) -> bool {
        let was_closed = self.closed.send_replace(true);
        if !was_closed {
            tracing::debug!(channel = %self.id, session = %self.session, "closing provider channel");
        }
        !was_closed
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the channel is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close the channel and shut down the write half of the transport.
    pub async fn shutdown(&self) {
        self.close();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(error) = writer.close().await {
                tracing::trace!(channel = %self.id, "error closing transport: {error}");
            }
        }
    }
}

/// Exclusive write access to a [`ProviderChannel`].
pub struct ChannelWriter<'c> {
    sink: tokio::sync::MutexGuard<'c, Option<Writer>>,
    channel: &'c ProviderChannel,
}

impl fmt::Debug for ChannelWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("channel", &self.channel.id)
            .finish()
    }
}

impl ChannelWriter<'_> {
    /// Send a frame, flushing it to the transport.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        if self.channel.is_closed() {
            return Err(ChannelError::Closed);
        }
        let sink = self.sink.as_mut().ok_or(ChannelError::Closed)?;

        let message = frame::encode(frame);
        let limit = self.channel.max_frame_size;
        if message.len() > limit {
            return Err(ChannelError::FrameTooLarge {
                size: message.len(),
                limit,
            });
        }

        let result = sink.send(message).await;
        match result {
            Ok(()) => {
                self.channel.activity.touch();
                Ok(())
            }
            // Refused before anything was written, so the transport is intact.
            Err(TransportError::FrameTooLarge { size, limit }) => {
                Err(ChannelError::FrameTooLarge { size, limit })
            }
            Err(error) => {
                tracing::debug!(channel = %self.channel.id, "transport write failed: {error}");
                self.sink.take();
                self.channel.close();
                Err(ChannelError::Transport(error))
            }
        }
    }
}

/// Inbound frames from a provider, in the order they were received.
///
/// Ends when the transport closes or fails. Transport failures are logged and
/// end the stream; undecodable messages are yielded as [`Malformed`] errors and
/// do not end it.
pub struct FrameStream {
    reader: SplitStream<BoxTransport>,
    activity: Arc<Activity>,
    channel: ChannelId,
    done: bool,
}

impl fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameStream")
            .field("channel", &self.channel)
            .field("done", &self.done)
            .finish()
    }
}

impl Stream for FrameStream {
    type Item = Result<Frame, Malformed>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match ready!(self.reader.poll_next_unpin(cx)) {
            Some(Ok(message)) => {
                self.activity.touch();
                Poll::Ready(Some(frame::decode(message)))
            }
            Some(Err(error)) => {
                tracing::debug!(channel = %self.channel, "transport read failed: {error}");
                self.done = true;
                Poll::Ready(None)
            }
            None => {
                tracing::trace!(channel = %self.channel, "transport closed by peer");
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::frame::RequestId;
    use crate::transport;

    use futures_util::{SinkExt as _, StreamExt as _};
    use static_assertions::assert_impl_all;

    assert_impl_all!(ProviderChannel: Send, Sync);
    assert_impl_all!(FrameStream: Send);

    #[tokio::test]
    async fn frames_cross_the_channel() {
        let (broker, provider) = transport::duplex(4096);
        let (channel, mut frames) = ProviderChannel::new("s1".into(), broker);
        let (peer, mut peer_frames) = ProviderChannel::new("s1".into(), provider);

        channel.send(&Frame::Ping).await.unwrap();
        assert_eq!(peer_frames.next().await.unwrap().unwrap(), Frame::Ping);

        let end = Frame::ResponseBodyEnd {
            req_id: RequestId::new(4),
        };
        peer.send(&end).await.unwrap();
        assert_eq!(frames.next().await.unwrap().unwrap(), end);
    }

    #[tokio::test]
    async fn malformed_messages_do_not_end_the_stream() {
        let (broker, mut provider) = transport::duplex(4096);
        let (_channel, mut frames) = ProviderChannel::new("s1".into(), broker);

        provider.send(Message::Text("{}".into())).await.unwrap();
        provider.send(frame::encode(&Frame::Pong)).await.unwrap();

        assert!(frames.next().await.unwrap().is_err());
        assert_eq!(frames.next().await.unwrap().unwrap(), Frame::Pong);
    }

    #[tokio::test]
    async fn oversized_frame_leaves_channel_open() {
        let (broker, provider) = transport::duplex(64 * 1024);
        let (channel, _frames) = ProviderChannel::with_max_frame_size("s1".into(), broker, 256);
        let (_peer, mut peer_frames) = ProviderChannel::new("s1".into(), provider);

        let huge = Frame::Error {
            req_id: RequestId::new(1),
            message: "x".repeat(1024),
        };
        let error = channel.send(&huge).await.unwrap_err();
        assert!(matches!(
            error,
            ChannelError::FrameTooLarge { limit: 256, .. }
        ));
        assert!(!channel.is_closed());

        channel.send(&Frame::Ping).await.unwrap();
        assert_eq!(peer_frames.next().await.unwrap().unwrap(), Frame::Ping);
    }

    #[tokio::test]
    async fn transport_limit_is_not_fatal() {
        let (broker, provider) = transport::duplex(64 * 1024);
        let (channel, _frames) =
            ProviderChannel::new("s1".into(), broker.with_max_frame_size(256));
        let (_peer, mut peer_frames) = ProviderChannel::new("s1".into(), provider);

        let huge = Frame::ResponseBodyChunk {
            req_id: RequestId::new(1),
            bytes: bytes::Bytes::from(vec![0u8; 1024]),
        };
        assert!(matches!(
            channel.send(&huge).await,
            Err(ChannelError::FrameTooLarge { limit: 256, .. })
        ));
        assert!(!channel.is_closed());

        channel.send(&Frame::Pong).await.unwrap();
        assert_eq!(peer_frames.next().await.unwrap().unwrap(), Frame::Pong);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (broker, _provider) = transport::duplex(4096);
        let (channel, _frames) = ProviderChannel::new("s1".into(), broker);

        assert!(channel.close());
        assert!(!channel.close());
        assert!(channel.is_closed());
        channel.closed().await;

        assert!(matches!(
            channel.send(&Frame::Ping).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn stream_ends_when_peer_goes_away() {
        let (broker, provider) = transport::duplex(4096);
        let (channel, mut frames) = ProviderChannel::new("s1".into(), broker);
        drop(provider);

        assert!(frames.next().await.is_none());
        assert!(frames.next().await.is_none());

        channel.shutdown().await;
        assert!(matches!(
            channel.send(&Frame::Ping).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_updates_activity() {
        let (broker, provider) = transport::duplex(4096);
        let (channel, _frames) = ProviderChannel::new("s1".into(), broker);
        let (_peer, mut peer_frames) = ProviderChannel::new("s1".into(), provider);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(channel.idle_for() >= Duration::from_secs(5));

        channel.send(&Frame::Ping).await.unwrap();
        assert_eq!(channel.idle_for(), Duration::ZERO);
        peer_frames.next().await.unwrap().unwrap();
    }
}
