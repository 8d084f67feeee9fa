//! Backhaul
//!
//! A reverse tunnel broker. Providers that cannot accept inbound connections dial
//! out to the broker and hold one persistent connection open; renters send plain
//! HTTP requests to a session, and the broker carries each request down the
//! provider's connection as a sequence of frames, then reassembles the provider's
//! replies into the HTTP response.
//!
//! The moving parts, leaf first:
//!
//! - [`frame`]: the wire frames and their codec.
//! - [`transport`]: the message transport a channel runs over.
//! - [`channel`]: one provider connection, with serialized writes.
//! - [`registry`]: session id to live provider channel.
//! - [`correlator`]: matches asynchronous replies to pending requests.
//! - [`tunnel`]: drives requests through all of the above.
//!
//! With the `server` feature, [`Server`] puts the tunnel behind an HTTP/1.1
//! listener where providers connect by upgrading their connection. The
//! `provider` feature carries the other end: dialing the broker and serving
//! tunnelled requests with any tower service.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::future::Future;
use std::pin::Pin;

pub mod body;
pub use body::Body;
pub mod bridge;
pub mod channel;
pub mod config;
pub use config::TunnelConfig;
pub mod correlator;
pub mod error;
pub use error::TunnelError;
pub mod frame;
pub use frame::Frame;
#[cfg(feature = "provider")]
pub mod provider;
pub mod registry;
pub use registry::SessionRegistry;
#[cfg(feature = "server")]
pub mod server;
#[cfg(feature = "server")]
pub use server::Server;
pub mod transport;
pub mod tunnel;
pub use tunnel::Tunnel;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
#[cfg_attr(not(feature = "server"), allow(dead_code))]
pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
