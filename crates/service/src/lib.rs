//! ## Signaling and session engine
//!
//! The service crate owns everything between the browser signaling hub
//! and the telephony wire: the SIP dialog state machine for both call
//! directions, the transaction layer with its retransmission timers,
//! the media-relay control client and the typed event stream the hub
//! consumes.
//!
//! The embedding binary owns the sockets and the configuration; this
//! crate is driven entirely through [`engine::Engine`].

pub mod dialog;
pub mod engine;
pub mod events;
pub mod relay;
pub mod sdp;
pub mod stats;
pub mod token;
pub mod transaction;
pub mod transport;

pub use engine::{Engine, EngineOptions};
pub use events::{Event, EventReceiver, EventSender};

#[derive(Debug)]
pub enum Error {
    Codec(codec::Error),
    Validation(&'static str),
    Relay(String),
    Protocol(&'static str),
    Capacity,
    NotFound,
    Timeout,
    ShuttingDown,
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
