//! Transport adapters for tandem nodes.
//!
//! Every wire protocol sits behind the same narrow [`Transport`] capability:
//! open a connection from its adapter-specific config, exchange whole
//! envelope frames, close. Listener helpers ([`tcp::TcpServer`]) sit beside
//! the connection types and hand out routes for accepted peers.

#![deny(clippy::all)]

mod config;
mod frame;
pub mod inproc;
pub mod ipc;
pub mod tcp;
pub mod udp;

pub use config::NetworkConfig;
pub use frame::EnvelopeCodec;

use tandem_runtime::{route::RouteError, ActionMessage};

/// One open connection to a peer node.
///
/// `open` takes the adapter's config record and establishes the link;
/// `send` transmits one envelope frame; `recv` blocks for the next inbound
/// frame; `close` releases the link. Adapters that deliver inbound traffic
/// into a sink mailbox (so a node can embed the connection and read its own
/// mailbox) serve `recv` from that same stream; callers pick one side of
/// that contract, not both.
pub trait Transport: Send {
    type Config;

    fn open(config: Self::Config) -> Result<Self, TransportError>
    where
        Self: Sized;

    fn send(&self, frame: ActionMessage) -> Result<(), TransportError>;

    /// Block until the next inbound frame arrives, or the link closes.
    fn recv(&mut self) -> Result<ActionMessage, TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;
}

/// The error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec failure: {0}")]
    Codec(#[from] tandem_runtime::CodecError),

    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),

    #[error("connection closed")]
    Closed,

    #[error("no space available on the link")]
    Full,

    #[error("no transport endpoint named {0:?}")]
    UnknownEndpoint(String),
}

impl From<RouteError> for TransportError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::Closed => TransportError::Closed,
            RouteError::Transport(text) => {
                TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, text))
            }
        }
    }
}
