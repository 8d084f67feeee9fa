//! The [`Body`] type carried through the tunnel.
//!
//! Tunnelled bodies arrive piece by piece as frames, long after the response
//! head has been handed to the renter, so besides the usual in-memory and boxed
//! bodies a `Body` can be fed from a [`BodySender`].

#![deny(missing_docs)]

use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http_body_util::BodyExt as _;
use http_body_util::Full;
use tokio::sync::mpsc;

use crate::BoxError;

/// An http request using [Body] as the body.
pub type Request = http::Request<Body>;

/// An http response using [Body] as the body.
pub type Response = http::Response<Body>;

/// A wrapper for the body types used by the tunnel, which implements
/// [http_body::Body](http_body::Body).
///
/// Bodies can be created from [`Bytes`](bytes::Bytes), [`String`](std::string::String),
/// or [`&'static str`](str) using [`From`](std::convert::From) implementations.
#[derive(Debug)]
#[pin_project::pin_project]
pub struct Body {
    #[pin]
    inner: InnerBody,
}

impl Body {
    /// Create a new `Body` that wraps another [`http_body::Body`].
    pub fn new<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            inner: InnerBody::Boxed(Box::pin(body.map_err(Into::into))),
        }
    }

    /// Create a new empty body.
    pub fn empty() -> Self {
        Self {
            inner: InnerBody::Empty,
        }
    }

    /// Create a body which is fed, chunk by chunk, through the returned sender.
    ///
    /// The body ends when the sender is dropped. Sending never waits, so the
    /// producer is never held up by a slow reader.
    pub fn channel() -> (BodySender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            BodySender { tx },
            Self {
                inner: InnerBody::Channel(rx),
            },
        )
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(body: Bytes) -> Self {
        if body.is_empty() {
            return Self::empty();
        }
        Self {
            inner: InnerBody::Full(body.into()),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(body: Vec<u8>) -> Self {
        Bytes::from(body).into()
    }
}

impl From<String> for Body {
    fn from(body: String) -> Self {
        Bytes::from(body).into()
    }
}

impl From<&'static str> for Body {
    fn from(body: &'static str) -> Self {
        Bytes::from_static(body.as_bytes()).into()
    }
}

/// Feeds a [`Body`] created by [`Body::channel`].
#[derive(Debug)]
pub struct BodySender {
    tx: mpsc::UnboundedSender<Result<Bytes, BoxError>>,
}

impl BodySender {
    /// Queue a chunk of data. Returns the chunk if the body has been dropped.
    pub fn send_data(&self, data: Bytes) -> Result<(), Bytes> {
        self.tx.send(Ok(data)).map_err(|returned| match returned.0 {
            Ok(data) => data,
            Err(_) => Bytes::new(),
        })
    }

    /// Abort the body with an error. The reader sees the error after any data
    /// already queued.
    pub fn send_error<E>(self, error: E)
    where
        E: Into<BoxError>,
    {
        let _ = self.tx.send(Err(error.into()));
    }

    /// Whether the receiving body has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[pin_project::pin_project(project = InnerBodyProj)]
enum InnerBody {
    Empty,
    Full(#[pin] Full<Bytes>),
    Boxed(#[pin] Pin<Box<dyn http_body::Body<Data = Bytes, Error = BoxError> + Send + 'static>>),
    Channel(mpsc::UnboundedReceiver<Result<Bytes, BoxError>>),
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match this.inner.project() {
            InnerBodyProj::Empty => Poll::Ready(None),
            InnerBodyProj::Full(body) => body
                .poll_frame(cx)
                .map(|opt| opt.map(|res| res.map_err(|never| match never {}))),
            InnerBodyProj::Boxed(body) => body.poll_frame(cx),
            InnerBodyProj::Channel(rx) => match ready!(rx.poll_recv(cx)) {
                Some(Ok(data)) => Poll::Ready(Some(Ok(http_body::Frame::data(data)))),
                Some(Err(error)) => Poll::Ready(Some(Err(error))),
                None => Poll::Ready(None),
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.inner {
            InnerBody::Empty => true,
            InnerBody::Full(ref body) => body.is_end_stream(),
            InnerBody::Boxed(ref body) => body.is_end_stream(),
            InnerBody::Channel(_) => false,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self.inner {
            InnerBody::Empty => http_body::SizeHint::with_exact(0),
            InnerBody::Full(ref body) => body.size_hint(),
            InnerBody::Boxed(ref body) => body.size_hint(),
            InnerBody::Channel(_) => http_body::SizeHint::default(),
        }
    }
}

impl fmt::Debug for InnerBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InnerBody::Empty => f.debug_struct("Empty").finish(),
            InnerBody::Full(_) => f.debug_struct("Full").finish(),
            InnerBody::Boxed(_) => f.debug_struct("Boxed").finish(),
            InnerBody::Channel(_) => f.debug_struct("Channel").finish(),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use http_body::Body as _;
    use http_body_util::BodyExt as _;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Body: Send);
    assert_impl_all!(BodySender: Send, Sync);

    #[tokio::test]
    async fn channel_body_yields_chunks_then_ends() {
        let (tx, body) = Body::channel();
        tx.send_data(Bytes::from_static(b"hello ")).unwrap();
        tx.send_data(Bytes::from_static(b"world")).unwrap();
        drop(tx);

        let data = body.collect().await.unwrap().to_bytes();
        assert_eq!(&*data, b"hello world");
    }

    #[tokio::test]
    async fn channel_body_surfaces_errors_after_data() {
        let (tx, mut body) = Body::channel();
        tx.send_data(Bytes::from_static(b"partial")).unwrap();
        tx.send_error("gone");

        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from_static(b"partial"));
        let error = body.frame().await.unwrap().unwrap_err();
        assert_eq!(error.to_string(), "gone");
        assert!(body.frame().await.is_none());
    }

    #[test]
    fn dropped_body_closes_sender() {
        let (tx, body) = Body::channel();
        drop(body);
        assert!(tx.is_closed());
        assert_eq!(
            tx.send_data(Bytes::from_static(b"late")),
            Err(Bytes::from_static(b"late"))
        );
    }

    #[tokio::test]
    async fn wrapped_and_static_bodies() {
        assert!(Body::empty().is_end_stream());
        assert!(Body::from("").is_end_stream());
        assert_eq!(Body::from("abc").size_hint().exact(), Some(3));

        let inner = http_body_util::Full::new(Bytes::from_static(b"boxed"));
        let data = Body::new(inner).collect().await.unwrap().to_bytes();
        assert_eq!(&*data, b"boxed");
    }
}
