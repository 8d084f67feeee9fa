//! The persistent, bidirectional message transport a provider channel runs over.
//!
//! A transport is anything which is both a [`Stream`] of inbound [`Message`]s and
//! a [`Sink`] for outbound ones. Two implementations ship with the crate:
//!
//! - [`FramedIo`], which length-delimits messages over any byte stream (a TCP
//!   socket, or a hyper connection after an HTTP/1.1 upgrade).
//! - [`duplex`], an in-memory pair of connected transports for running a broker
//!   and a provider in the same process.

use std::io;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::Sink;

mod framed;

pub use self::framed::FramedIo;
pub use self::framed::DEFAULT_MAX_FRAME_SIZE;

/// One unit of data on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A UTF-8 text message.
    Text(String),

    /// An opaque binary message.
    Binary(Bytes),
}

impl Message {
    /// Size of the message payload, in bytes.
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the message payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Error on a message transport.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The underlying I/O failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A message exceeds the configured frame size limit.
    #[error("message of {size} bytes exceeds the limit of {limit} bytes")]
    FrameTooLarge {
        /// Size of the offending message.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A frame carries an unknown message kind.
    #[error("unknown message kind: {0:#04x}")]
    UnknownKind(u8),

    /// A text message is not valid UTF-8.
    #[error("text message is not valid utf-8")]
    InvalidUtf8,

    /// The peer closed the connection in the middle of a message.
    #[error("connection closed mid-message ({0} bytes buffered)")]
    Truncated(usize),
}

/// A persistent bidirectional message transport.
///
/// This is implemented for every type with the right [`Stream`] and [`Sink`]
/// implementations, so it never needs to be implemented by hand.
pub trait Transport:
    Stream<Item = Result<Message, TransportError>>
    + Sink<Message, Error = TransportError>
    + Send
    + Unpin
    + 'static
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<Message, TransportError>>
        + Sink<Message, Error = TransportError>
        + Send
        + Unpin
        + 'static
{
}

pub(crate) type BoxTransport = Box<dyn Transport>;

/// Create a pair of connected in-memory transports.
///
/// Messages sent on one end arrive at the other end. `max_buf_size` bounds the
/// number of bytes in flight in each direction, applying backpressure to the
/// writer.
pub fn duplex(
    max_buf_size: usize,
) -> (
    FramedIo<tokio::io::DuplexStream>,
    FramedIo<tokio::io::DuplexStream>,
) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (FramedIo::new(a), FramedIo::new(b))
}
