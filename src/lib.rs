//! A bidirectional TCP tunnel disguised as a pair of ordinary HTTP/1.1
//! exchanges.
//!
//! Each local connection accepted by the [`Client`] is carried by two
//! long-lived requests against the same web endpoint: a `POST` whose chunked
//! body streams the local read side upward, and a `GET` whose chunked
//! response streams the remote side back down. The [`Server`] terminates both
//! requests, pairs them by their `X-Session-Id` header, and bridges the pair
//! to a single upstream TCP destination.

mod chunked;
pub mod client;
mod parse;
pub mod server;
mod util;

pub use client::{Client, ClientOpts};
pub use server::Server;

/// HTTP header carrying the session pairing token.
pub const SESSION_ID_HEADER: &str = "X-Session-Id";

/// Longest session id the server accepts, in octets.
pub(crate) const MAX_SESSION_ID_LEN: usize = 16;

/// How much data to read for the request header section before it's considered invalid.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

#[cfg(test)]
mod tests;
