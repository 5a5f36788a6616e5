//! Server error types

use shared::ProtocolError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Every client id is in use
    #[error("no free client id available")]
    CapacityExhausted,

    /// A targeted send named an id that is not connected
    #[error("no client with id {0}")]
    NoSuchClient(u8),

    /// A message arrived from an endpoint that never connected
    #[error("message from unknown endpoint {0}")]
    UnknownClient(SocketAddr),

    #[error("server is not running")]
    NotRunning,

    #[error("malformed packet: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
}
