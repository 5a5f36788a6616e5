//! # Shared Protocol Library
//!
//! Types and pure functions used by both ends of the UDP session protocol:
//!
//! - [`codec`]: datagram framing and per-message layouts
//! - [`packet`]: the application-facing [`Packet`] with typed payload readers,
//!   and [`PayloadBuilder`] for writing payloads
//! - [`channel`]: the queue that hands packets from the network task to the
//!   application
//! - [`error`]: [`ProtocolError`], raised for every malformed datagram
//!
//! Nothing here performs I/O.

pub mod channel;
pub mod codec;
pub mod error;
pub mod packet;

pub use channel::Channel;
pub use codec::{decode, decode_as, DecodedMessage, Message, MessageType, SERVER_ID};
pub use error::ProtocolError;
pub use packet::{Packet, PacketMode, PayloadBuilder};

use serde::{Deserialize, Serialize};

/// Discovery blob the bundled server returns for INFO probes
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerInfo {
    pub name: String,
    pub version: u32,
    pub clients: u32,
}

impl ServerInfo {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
