#![deny(missing_docs)]

//! # tapwire
//!
//! Low-level HTTP/1.x wire plumbing shared by the tapwire proxy engine and
//! its composer. The crate deliberately stays small:
//!
//! - [`Outbound`] models a request headed for an origin server and knows how
//!   to serialize itself as raw HTTP/1.1 bytes.
//! - [`Connector`] opens TCP connections and upgrades them to TLS. Origin
//!   certificates are **never** validated; this is an inspection tool, not a
//!   trust anchor.
//! - [`InboundResponse`] parses a status line and headers off a socket and
//!   then yields the body as a stream of payload chunks, decoding
//!   `Content-Length`, chunked and read-to-close framing.
//!
//! There is no redirect handling, no cookie jar, no connection pool and no
//! HTTP/2. Callers that need a buffered response use
//! [`InboundResponse::collect`].

mod body;
mod connector;
mod errors;
mod outbound;
mod response;
pub mod tls;

pub use body::Body;
pub use connector::{Connector, Stream};
pub use errors::{Error, Result};
pub use http::{HeaderMap, Method, StatusCode, Uri, Version};
pub use outbound::Outbound;
pub use response::{InboundResponse, ResponseHead};

pub(crate) const CR_LF: &[u8] = b"\r\n";
pub(crate) const COLON_SPACE: &[u8] = b": ";

/// Maximum accepted length of a status line or a single header line.
pub(crate) const MAX_LINE: usize = 16 * 1024;
