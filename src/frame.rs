//! Frames exchanged over a provider channel, and the codec which maps them
//! onto transport [`Message`]s.
//!
//! Control frames travel as text messages holding a JSON object with an explicit
//! `type` discriminator. Body chunks travel as binary messages with a fixed
//! 9 byte prefix: a direction tag and the big-endian request id. The message kind
//! is the framing boundary, so body bytes are never inspected and can never be
//! mistaken for a control frame.

use std::fmt;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::transport::Message;

const REQUEST_CHUNK: u8 = 0x01;
const RESPONSE_CHUNK: u8 = 0x02;
const CHUNK_PREFIX: usize = 1 + 8;

/// Identifies one request within a session.
///
/// Ids are only unique among the requests currently pending on a session; an id
/// may be handed out again once the request holding it has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Wrap a raw request id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw request id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One message unit on a provider channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Start of a forwarded request.
    RequestHeader {
        /// Request this frame belongs to.
        req_id: RequestId,
        /// HTTP method.
        method: Method,
        /// Path and query, relative to the session.
        path: String,
        /// Request headers, hop-by-hop headers already removed.
        headers: HeaderMap,
    },

    /// A piece of the request body.
    RequestBodyChunk {
        /// Request this frame belongs to.
        req_id: RequestId,
        /// Raw body bytes.
        bytes: Bytes,
    },

    /// The request body is complete.
    RequestBodyEnd {
        /// Request this frame belongs to.
        req_id: RequestId,
    },

    /// Start of the provider's response.
    ResponseHeader {
        /// Request this frame belongs to.
        req_id: RequestId,
        /// HTTP status.
        status: StatusCode,
        /// Response headers.
        headers: HeaderMap,
    },

    /// A piece of the response body.
    ResponseBodyChunk {
        /// Request this frame belongs to.
        req_id: RequestId,
        /// Raw body bytes.
        bytes: Bytes,
    },

    /// The response body is complete.
    ResponseBodyEnd {
        /// Request this frame belongs to.
        req_id: RequestId,
    },

    /// The provider failed to produce a response.
    Error {
        /// Request this frame belongs to.
        req_id: RequestId,
        /// Human readable reason.
        message: String,
    },

    /// The renter went away; the provider may stop working on this request.
    Cancel {
        /// Request this frame belongs to.
        req_id: RequestId,
    },

    /// Keepalive request.
    Ping,

    /// Keepalive answer.
    Pong,
}

impl Frame {
    /// The request this frame belongs to, if it belongs to one.
    pub fn req_id(&self) -> Option<RequestId> {
        match self {
            Frame::RequestHeader { req_id, .. }
            | Frame::RequestBodyChunk { req_id, .. }
            | Frame::RequestBodyEnd { req_id }
            | Frame::ResponseHeader { req_id, .. }
            | Frame::ResponseBodyChunk { req_id, .. }
            | Frame::ResponseBodyEnd { req_id }
            | Frame::Error { req_id, .. }
            | Frame::Cancel { req_id } => Some(*req_id),
            Frame::Ping | Frame::Pong => None,
        }
    }

    /// Short name of the frame kind, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::RequestHeader { .. } => "request_header",
            Frame::RequestBodyChunk { .. } => "request_body_chunk",
            Frame::RequestBodyEnd { .. } => "request_body_end",
            Frame::ResponseHeader { .. } => "response_header",
            Frame::ResponseBodyChunk { .. } => "response_body_chunk",
            Frame::ResponseBodyEnd { .. } => "response_body_end",
            Frame::Error { .. } => "error",
            Frame::Cancel { .. } => "cancel",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
        }
    }
}

/// A message could not be decoded into a [`Frame`].
///
/// This is a protocol violation by the peer, never a reason to abort the process.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Malformed {
    /// The text message was not a valid control frame.
    #[error("invalid control frame: {0}")]
    Control(#[from] serde_json::Error),

    /// The method in a request header is not a valid HTTP method.
    #[error("invalid method: {0:?}")]
    Method(String),

    /// The status in a response header is not a valid HTTP status.
    #[error("invalid status code: {0}")]
    Status(u16),

    /// A header name or value is invalid.
    #[error("invalid header: {0:?}")]
    Header(String),

    /// A binary message is shorter than the chunk prefix.
    #[error("binary frame too short: {0} bytes")]
    Truncated(usize),

    /// A binary message carries an unknown direction tag.
    #[error("unknown binary frame tag: {0:#04x}")]
    UnknownTag(u8),
}

/// Header values travel as strings when they are visible ASCII, and as an array
/// of byte values otherwise, so obs-text survives the trip unchanged.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireValue {
    Text(String),
    Bytes(Vec<u8>),
}

type HeaderList = Vec<(String, WireValue)>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Control {
    RequestHeader {
        req_id: RequestId,
        method: String,
        path: String,
        #[serde(default)]
        headers: HeaderList,
    },
    RequestBodyEnd {
        req_id: RequestId,
    },
    ResponseHeader {
        req_id: RequestId,
        status: u16,
        #[serde(default)]
        headers: HeaderList,
    },
    ResponseBodyEnd {
        req_id: RequestId,
    },
    Error {
        req_id: RequestId,
        message: String,
    },
    Cancel {
        req_id: RequestId,
    },
    Ping,
    Pong,
}

/// Encode a frame into a transport message.
pub fn encode(frame: &Frame) -> Message {
    let mut object = Map::new();
    object.insert("type".to_owned(), frame.name().into());
    if let Some(req_id) = frame.req_id() {
        object.insert("req_id".to_owned(), req_id.get().into());
    }

    match frame {
        Frame::RequestBodyChunk { req_id, bytes } => {
            return Message::Binary(chunk(REQUEST_CHUNK, *req_id, bytes))
        }
        Frame::ResponseBodyChunk { req_id, bytes } => {
            return Message::Binary(chunk(RESPONSE_CHUNK, *req_id, bytes))
        }
        Frame::RequestHeader {
            method,
            path,
            headers,
            ..
        } => {
            object.insert("method".to_owned(), method.as_str().into());
            object.insert("path".to_owned(), path.as_str().into());
            object.insert("headers".to_owned(), header_list(headers));
        }
        Frame::ResponseHeader {
            status, headers, ..
        } => {
            object.insert("status".to_owned(), status.as_u16().into());
            object.insert("headers".to_owned(), header_list(headers));
        }
        Frame::Error { message, .. } => {
            object.insert("message".to_owned(), message.as_str().into());
        }
        Frame::RequestBodyEnd { .. }
        | Frame::ResponseBodyEnd { .. }
        | Frame::Cancel { .. }
        | Frame::Ping
        | Frame::Pong => {}
    }

    Message::Text(Value::Object(object).to_string())
}

/// Decode a transport message into a frame.
pub fn decode(message: Message) -> Result<Frame, Malformed> {
    match message {
        Message::Binary(bytes) => decode_chunk(bytes),
        Message::Text(text) => decode_control(&text),
    }
}

fn chunk(tag: u8, req_id: RequestId, bytes: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHUNK_PREFIX + bytes.len());
    buf.put_u8(tag);
    buf.put_u64(req_id.get());
    buf.put_slice(bytes);
    buf.freeze()
}

fn decode_chunk(mut bytes: Bytes) -> Result<Frame, Malformed> {
    if bytes.len() < CHUNK_PREFIX {
        return Err(Malformed::Truncated(bytes.len()));
    }

    let tag = bytes.get_u8();
    let req_id = RequestId(bytes.get_u64());
    match tag {
        REQUEST_CHUNK => Ok(Frame::RequestBodyChunk { req_id, bytes }),
        RESPONSE_CHUNK => Ok(Frame::ResponseBodyChunk { req_id, bytes }),
        other => Err(Malformed::UnknownTag(other)),
    }
}

fn decode_control(text: &str) -> Result<Frame, Malformed> {
    let frame = match serde_json::from_str::<Control>(text)? {
        Control::RequestHeader {
            req_id,
            method,
            path,
            headers,
        } => Frame::RequestHeader {
            req_id,
            method: Method::from_bytes(method.as_bytes()).map_err(|_| Malformed::Method(method))?,
            path,
            headers: header_map(headers)?,
        },
        Control::RequestBodyEnd { req_id } => Frame::RequestBodyEnd { req_id },
        Control::ResponseHeader {
            req_id,
            status,
            headers,
        } => Frame::ResponseHeader {
            req_id,
            status: StatusCode::from_u16(status).map_err(|_| Malformed::Status(status))?,
            headers: header_map(headers)?,
        },
        Control::ResponseBodyEnd { req_id } => Frame::ResponseBodyEnd { req_id },
        Control::Error { req_id, message } => Frame::Error { req_id, message },
        Control::Cancel { req_id } => Frame::Cancel { req_id },
        Control::Ping => Frame::Ping,
        Control::Pong => Frame::Pong,
    };
    Ok(frame)
}

fn header_list(headers: &HeaderMap) -> Value {
    headers
        .iter()
        .map(|(name, value)| {
            let value = match value.to_str() {
                Ok(text) => Value::from(text),
                Err(_) => Value::from(value.as_bytes()),
            };
            Value::Array(vec![name.as_str().into(), value])
        })
        .collect()
}

fn header_map(headers: HeaderList) -> Result<HeaderMap, Malformed> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| Malformed::Header(name))?;
        let value = match value {
            WireValue::Text(text) => {
                HeaderValue::from_str(&text).map_err(|_| Malformed::Header(text))?
            }
            WireValue::Bytes(bytes) => HeaderValue::from_bytes(&bytes)
                .map_err(|_| Malformed::Header(String::from_utf8_lossy(&bytes).into_owned()))?,
        };
        map.append(name, value);
    }
    Ok(map)
}
