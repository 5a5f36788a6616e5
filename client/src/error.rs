//! Client error types

use shared::ProtocolError;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("malformed packet: {0}")]
    Protocol(#[from] ProtocolError),

    /// No reply arrived within the configured wait
    #[error("no reply from server within {0:?}")]
    Timeout(Duration),

    /// The server answered CONNECT with a disconnect, usually because it is full
    #[error("server refused the connection")]
    Refused,

    #[error("not connected")]
    NotConnected,
}
