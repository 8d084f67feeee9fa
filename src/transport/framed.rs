//! Length-delimited messages over a byte stream.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf as _, BufMut as _, BytesMut};
use futures_core::Stream;
use futures_util::Sink;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{Message, TransportError};

/// Default limit on the payload of a single message (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

const TEXT: u8 = 0x00;
const BINARY: u8 = 0x01;
const HEADER_LEN: usize = 4 + 1;
const READ_CHUNK: usize = 8 * 1024;
const WRITE_HIGH_WATER: usize = 64 * 1024;

/// Messages framed over a byte stream.
///
/// Each message is written as a 4 byte big-endian payload length, a 1 byte kind
/// (text or binary), and the payload itself. Messages larger than
/// [`max_frame_size`](FramedIo::max_frame_size) are refused in both directions.
#[derive(Debug)]
pub struct FramedIo<IO> {
    io: IO,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_frame_size: usize,
    eof: bool,
}

impl<IO> FramedIo<IO> {
    /// Frame messages over `io`, with the default frame size limit.
    pub fn new(io: IO) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            eof: false,
        }
    }

    /// Set the largest payload accepted in a single message.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// The largest payload accepted in a single message.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Borrow the underlying byte stream.
    pub fn get_ref(&self) -> &IO {
        &self.io
    }

    /// Unwrap the underlying byte stream, discarding any buffered data.
    pub fn into_inner(self) -> IO {
        self.io
    }

    fn decode(&mut self) -> Result<Option<Message>, TransportError> {
        if self.read_buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let size = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;

        if size > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }

        if self.read_buf.len() < HEADER_LEN + size {
            self.read_buf.reserve(HEADER_LEN + size - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(4);
        let kind = self.read_buf.get_u8();
        let payload = self.read_buf.split_to(size).freeze();

        match kind {
            TEXT => String::from_utf8(Vec::from(payload))
                .map(Message::Text)
                .map(Some)
                .map_err(|_| TransportError::InvalidUtf8),
            BINARY => Ok(Some(Message::Binary(payload))),
            other => Err(TransportError::UnknownKind(other)),
        }
    }

    /// The read side is unusable after an error; stop yielding messages.
    fn terminate(&mut self) {
        self.eof = true;
        self.read_buf.clear();
    }
}

impl<IO> FramedIo<IO>
where
    IO: AsyncWrite + Unpin,
{
    fn poll_write_buf(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), TransportError>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::WriteZero).into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<IO> Stream for FramedIo<IO>
where
    IO: AsyncRead + Unpin,
{
    type Item = Result<Message, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.decode() {
                Ok(Some(message)) => return Poll::Ready(Some(Ok(message))),
                Ok(None) => {}
                Err(error) => {
                    this.terminate();
                    return Poll::Ready(Some(Err(error)));
                }
            }

            if this.eof {
                if this.read_buf.is_empty() {
                    return Poll::Ready(None);
                }
                let buffered = this.read_buf.len();
                this.terminate();
                return Poll::Ready(Some(Err(TransportError::Truncated(buffered))));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut buf = ReadBuf::new(&mut chunk);
            if let Err(error) = ready!(Pin::new(&mut this.io).poll_read(cx, &mut buf)) {
                this.terminate();
                return Poll::Ready(Some(Err(error.into())));
            }

            if buf.filled().is_empty() {
                this.eof = true;
            } else {
                this.read_buf.extend_from_slice(buf.filled());
            }
        }
    }
}

impl<IO> Sink<Message> for FramedIo<IO>
where
    IO: AsyncWrite + Unpin,
{
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        if this.write_buf.len() >= WRITE_HIGH_WATER {
            ready!(this.poll_write_buf(cx))?;
        }
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        let this = self.get_mut();
        let (kind, payload): (u8, &[u8]) = match &item {
            Message::Text(text) => (TEXT, text.as_bytes()),
            Message::Binary(bytes) => (BINARY, &bytes[..]),
        };

        let size = payload.len();
        let too_large = TransportError::FrameTooLarge {
            size,
            limit: this.max_frame_size,
        };
        if size > this.max_frame_size {
            return Err(too_large);
        }
        let prefix = u32::try_from(size).map_err(|_| too_large)?;

        this.write_buf.reserve(HEADER_LEN + size);
        this.write_buf.put_u32(prefix);
        this.write_buf.put_u8(kind);
        this.write_buf.put_slice(payload);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        ready!(this.poll_write_buf(cx))?;
        Pin::new(&mut this.io).poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        ready!(this.poll_write_buf(cx))?;
        ready!(Pin::new(&mut this.io).poll_flush(cx))?;
        Pin::new(&mut this.io).poll_shutdown(cx).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use futures_util::{SinkExt as _, StreamExt as _};
    use tokio::io::AsyncWriteExt as _;

    #[tokio::test]
    async fn reads_messages_split_across_writes() {
        let (mut raw, io) = tokio::io::duplex(64);
        let mut framed = FramedIo::new(io);

        let reader = tokio::spawn(async move {
            let first = framed.next().await.unwrap().unwrap();
            let second = framed.next().await.unwrap().unwrap();
            (first, second, framed.next().await.is_none())
        });

        raw.write_all(&[0, 0, 0, 2, TEXT, b'h']).await.unwrap();
        raw.write_all(&[b'i', 0, 0, 0, 3, BINARY]).await.unwrap();
        raw.write_all(&[1, 2, 3]).await.unwrap();
        drop(raw);

        let (first, second, ended) = reader.await.unwrap();
        assert_eq!(first, Message::Text("hi".into()));
        assert_eq!(second, Message::Binary(Bytes::from_static(&[1, 2, 3])));
        assert!(ended);
    }

    #[tokio::test]
    async fn refuses_oversized_messages() {
        let (a, b) = tokio::io::duplex(1024);
        let mut sender = FramedIo::new(a).with_max_frame_size(4);
        let err = sender
            .send(Message::Binary(Bytes::from_static(b"too long")))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size: 8, limit: 4 }));

        let mut raw = FramedIo::new(sender.into_inner());
        raw.send(Message::Binary(Bytes::from_static(b"too long")))
            .await
            .unwrap();

        let mut receiver = FramedIo::new(b).with_max_frame_size(4);
        assert!(matches!(
            receiver.next().await.unwrap(),
            Err(TransportError::FrameTooLarge { size: 8, limit: 4 })
        ));
        assert!(receiver.next().await.is_none());
    }

    #[tokio::test]
    async fn truncated_message_is_an_error() {
        let (mut raw, io) = tokio::io::duplex(64);
        let mut framed = FramedIo::new(io);

        raw.write_all(&[0, 0, 0, 10, BINARY, 1, 2]).await.unwrap();
        drop(raw);

        assert!(matches!(
            framed.next().await.unwrap(),
            Err(TransportError::Truncated(7))
        ));
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn rejects_unknown_kind_and_bad_utf8() {
        let (mut raw, io) = tokio::io::duplex(64);
        let mut framed = FramedIo::new(io);
        raw.write_all(&[0, 0, 0, 1, 0x7f, 0]).await.unwrap();
        assert!(matches!(
            framed.next().await.unwrap(),
            Err(TransportError::UnknownKind(0x7f))
        ));

        let (mut raw, io) = tokio::io::duplex(64);
        let mut framed = FramedIo::new(io);
        raw.write_all(&[0, 0, 0, 1, TEXT, 0xff]).await.unwrap();
        assert!(matches!(
            framed.next().await.unwrap(),
            Err(TransportError::InvalidUtf8)
        ));
    }
}
