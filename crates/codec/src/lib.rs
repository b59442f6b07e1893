//! ## Session Initiation Protocol message codec
//!
//! [RFC3261]: https://tools.ietf.org/html/rfc3261
//!
//! SIP is a text-based protocol with a request line or status line,
//! a header section, an empty line and an optional body. Header names
//! are case-insensitive, long lines may be folded onto continuation
//! lines, and a handful of headers have single-letter compact forms.
//! The Via header is intrinsically multi-valued and ordered: the top
//! entry names the immediate upstream hop and is the one rewritten in
//! place for NAT traversal.
//!
//! The codec is total on malformed input: every parse failure is a
//! structured [`Error`] so the transport can drop the datagram without
//! unwinding.

pub mod message;

pub use message::{Headers, Message, Method, Request, Response, uri, via};

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    Empty,
    InvalidStartLine,
    InvalidHeaderLine,
    InvalidStatusCode,
    InvalidCSeq,
    InvalidVia,
    InvalidUri,
    MissingHeader(&'static str),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
