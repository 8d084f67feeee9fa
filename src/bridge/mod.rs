//! Adapters between hyper's connection traits and the tokio / tower world the
//! broker is written against.

pub mod io;
pub mod service;
