//! Errors raised while framing, parsing, or reading protocol messages.

use crate::codec::MessageType;
use crate::packet::PacketMode;
use thiserror::Error;

/// A datagram or payload that does not satisfy the wire contract.
///
/// Every variant carries the raw values that were observed so the receive
/// loop can log exactly what was dropped.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ProtocolError {
    /// Fewer bytes than the transport header.
    #[error("datagram too short: need at least {needed} bytes, got {available}")]
    TooShort { needed: usize, available: usize },

    #[error("invalid magic byte: 0x{0:02X}")]
    BadMagic(u8),

    #[error("invalid sequence byte: {0}")]
    BadSequence(u8),

    /// The header size byte disagrees with the bytes that actually follow it.
    #[error("content size mismatch: header says {declared}, datagram carries {actual}")]
    SizeMismatch { declared: usize, actual: usize },

    /// The content length is not valid for the message type.
    #[error("invalid {message_type:?} size: expected {expected}, got {actual}")]
    UnexpectedSize {
        message_type: MessageType,
        expected: usize,
        actual: usize,
    },

    #[error("message type mismatch: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("client id mismatch: expected {expected}, got {actual}")]
    ClientIdMismatch { expected: u8, actual: u8 },

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("unknown packet mode: {0}")]
    UnknownMode(u8),

    /// A known mode byte that does not belong to the message type.
    #[error("invalid {message_type:?} mode: expected {expected:?}, got {actual:?}")]
    ModeMismatch {
        message_type: MessageType,
        expected: PacketMode,
        actual: PacketMode,
    },

    #[error("content too large: {size} bytes exceeds the {max} byte limit")]
    ContentTooLarge { size: usize, max: usize },

    /// A typed read ran past the end of a packet payload.
    #[error("buffer underflow: need {needed} bytes, {remaining} remaining")]
    BufferUnderflow { needed: usize, remaining: usize },

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
}
