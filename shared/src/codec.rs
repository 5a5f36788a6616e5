//! Wire codec for the UDP session protocol
//!
//! Wire format:
//! ```text
//! [magic:1 = 0x96][sequence:1 = 0][content_size:1][content:content_size]
//! ```
//!
//! Content starts with `[message_type:1][client_id:1]` followed by the
//! type-specific payload. The INFO discovery probe is the one exception: its
//! content is the type byte alone, and an INFO reply is the type byte followed
//! by an application-defined blob.
//!
//! | Type         | Payload after the common prefix                         |
//! |--------------|---------------------------------------------------------|
//! | CONNECT      | none                                                    |
//! | DISCONNECT   | `[mode:1][disconnected_id:1]`                           |
//! | ALIVE, PING  | none                                                    |
//! | CLIENTS_LIST | one byte per listed client id                           |
//! | DIRECT, DATA | `[mode:1][source_id:1][data_id:4][payload:N]`           |
//! | NAME_SET     | `[target_id:1][name_len:4][name:name_len]`              |
//!
//! The mode byte must match the type: DIRECT 0, DATA 1, DISCONNECT 2.
//! All multi-byte integers are big-endian. Encoding and decoding are pure;
//! nothing in this module touches a socket.

use crate::error::ProtocolError;
use crate::packet::{Packet, PacketMode};

pub const MAGIC: u8 = 0x96;
pub const SEQUENCE: u8 = 0;
pub const HEADER_SIZE: usize = 3;
/// Size of the receive buffer on both ends of a connection
pub const BUFFER_SIZE: usize = 256;
pub const MAX_CONTENT_SIZE: usize = BUFFER_SIZE - HEADER_SIZE;
/// Client id the server uses for itself
pub const SERVER_ID: u8 = 0;
/// Most ids a single CLIENTS_LIST can carry
pub const MAX_LISTED_CLIENTS: usize = MAX_CONTENT_SIZE - PREFIX_SIZE;

const PREFIX_SIZE: usize = 2;
const DATA_PREFIX_SIZE: usize = PREFIX_SIZE + 6;
const NAME_SET_PREFIX_SIZE: usize = PREFIX_SIZE + 5;

// Offsets into a full datagram, used for in-place relay rewriting
const CLIENT_ID_OFFSET: usize = HEADER_SIZE + 1;
const SOURCE_ID_OFFSET: usize = HEADER_SIZE + 3;

/// Message kinds. The discriminant is the wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Connect = 0,
    Disconnect = 1,
    Alive = 2,
    Ping = 3,
    ClientsList = 4,
    Direct = 5,
    Data = 6,
    Info = 7,
    NameSet = 8,
    Unknown = 9,
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            0 => MessageType::Connect,
            1 => MessageType::Disconnect,
            2 => MessageType::Alive,
            3 => MessageType::Ping,
            4 => MessageType::ClientsList,
            5 => MessageType::Direct,
            6 => MessageType::Data,
            7 => MessageType::Info,
            8 => MessageType::NameSet,
            _ => MessageType::Unknown,
        }
    }
}

/// An outbound message
///
/// The client id written into the common prefix is supplied at encode time,
/// which lets one message be rendered once per recipient.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Connection request (client id 0) or acknowledgment (assigned id)
    Connected,
    /// `client_id` has left; the server id means the server is going away
    Disconnected { client_id: u8 },
    Alive,
    Ping,
    ClientsList { client_ids: Vec<u8> },
    /// `forward` selects DATA (relayed to every peer) over DIRECT
    Data {
        forward: bool,
        source_id: u8,
        data_id: u32,
        payload: Vec<u8>,
    },
    Direct {
        source_id: u8,
        data_id: u32,
        payload: Vec<u8>,
    },
    /// Reply to an INFO probe
    Info { blob: Vec<u8> },
    /// `client_id` is now called `name`
    NameSet { client_id: u8, name: String },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Connected => MessageType::Connect,
            Message::Disconnected { .. } => MessageType::Disconnect,
            Message::Alive => MessageType::Alive,
            Message::Ping => MessageType::Ping,
            Message::ClientsList { .. } => MessageType::ClientsList,
            Message::Data { forward: true, .. } => MessageType::Data,
            Message::Data { forward: false, .. } | Message::Direct { .. } => MessageType::Direct,
            Message::Info { .. } => MessageType::Info,
            Message::NameSet { .. } => MessageType::NameSet,
        }
    }

    /// Encodes the message as a complete datagram addressed to `client_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ContentTooLarge`] if the content does not fit
    /// in a single datagram.
    pub fn encode(&self, client_id: u8) -> Result<Vec<u8>, ProtocolError> {
        let message_type = self.message_type();
        let mut content = vec![message_type as u8];

        if let Message::Info { blob } = self {
            content.extend_from_slice(blob);
            return frame(&content);
        }

        content.push(client_id);

        match self {
            Message::Connected | Message::Alive | Message::Ping => {}
            Message::Disconnected { client_id } => {
                content.push(PacketMode::Disconnect as u8);
                content.push(*client_id);
            }
            Message::ClientsList { client_ids } => {
                content.extend_from_slice(client_ids);
            }
            Message::Data {
                source_id,
                data_id,
                payload,
                forward,
            } => {
                let mode = if *forward {
                    PacketMode::Data
                } else {
                    PacketMode::Direct
                };
                write_data(&mut content, mode, *source_id, *data_id, payload);
            }
            Message::Direct {
                source_id,
                data_id,
                payload,
            } => {
                write_data(
                    &mut content,
                    PacketMode::Direct,
                    *source_id,
                    *data_id,
                    payload,
                );
            }
            Message::NameSet { client_id, name } => {
                content.push(*client_id);
                content.extend_from_slice(&(name.len() as u32).to_be_bytes());
                content.extend_from_slice(name.as_bytes());
            }
            Message::Info { .. } => unreachable!("info content is written above"),
        }

        frame(&content)
    }
}

fn write_data(
    content: &mut Vec<u8>,
    mode: PacketMode,
    source_id: u8,
    data_id: u32,
    payload: &[u8],
) {
    content.push(mode as u8);
    content.push(source_id);
    content.extend_from_slice(&data_id.to_be_bytes());
    content.extend_from_slice(payload);
}

fn frame(content: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if content.len() > MAX_CONTENT_SIZE {
        return Err(ProtocolError::ContentTooLarge {
            size: content.len(),
            max: MAX_CONTENT_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + content.len());
    buf.push(MAGIC);
    buf.push(SEQUENCE);
    buf.push(content.len() as u8);
    buf.extend_from_slice(content);
    Ok(buf)
}

/// The anonymous discovery probe: content is the INFO type byte only.
pub fn encode_info_request() -> Vec<u8> {
    vec![MAGIC, SEQUENCE, 1, MessageType::Info as u8]
}

/// A message decoded from a datagram
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Connect {
        client_id: u8,
    },
    Disconnect {
        client_id: u8,
        mode: PacketMode,
        disconnected_id: u8,
    },
    Alive {
        client_id: u8,
    },
    Ping {
        client_id: u8,
    },
    ClientsList {
        client_id: u8,
        client_ids: Vec<u8>,
    },
    Direct(Packet),
    Data(Packet),
    InfoRequest,
    Info {
        blob: Vec<u8>,
    },
    NameSet {
        sender_id: u8,
        client_id: u8,
        name: String,
    },
}

impl DecodedMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            DecodedMessage::Connect { .. } => MessageType::Connect,
            DecodedMessage::Disconnect { .. } => MessageType::Disconnect,
            DecodedMessage::Alive { .. } => MessageType::Alive,
            DecodedMessage::Ping { .. } => MessageType::Ping,
            DecodedMessage::ClientsList { .. } => MessageType::ClientsList,
            DecodedMessage::Direct(_) => MessageType::Direct,
            DecodedMessage::Data(_) => MessageType::Data,
            DecodedMessage::InfoRequest | DecodedMessage::Info { .. } => MessageType::Info,
            DecodedMessage::NameSet { .. } => MessageType::NameSet,
        }
    }

    /// The client id byte of the common prefix; INFO has none.
    pub fn client_id(&self) -> Option<u8> {
        match self {
            DecodedMessage::Connect { client_id }
            | DecodedMessage::Disconnect { client_id, .. }
            | DecodedMessage::Alive { client_id }
            | DecodedMessage::Ping { client_id }
            | DecodedMessage::ClientsList { client_id, .. } => Some(*client_id),
            DecodedMessage::Direct(packet) | DecodedMessage::Data(packet) => {
                Some(packet.client_id())
            }
            DecodedMessage::NameSet { sender_id, .. } => Some(*sender_id),
            DecodedMessage::InfoRequest | DecodedMessage::Info { .. } => None,
        }
    }

    /// Fails unless the client id byte equals `expected`.
    pub fn expect_client(&self, expected: u8) -> Result<(), ProtocolError> {
        match self.client_id() {
            Some(actual) if actual != expected => {
                Err(ProtocolError::ClientIdMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }
}

/// Validates the transport header and returns the message content.
pub fn content(datagram: &[u8]) -> Result<&[u8], ProtocolError> {
    if datagram.len() < HEADER_SIZE {
        return Err(ProtocolError::TooShort {
            needed: HEADER_SIZE,
            available: datagram.len(),
        });
    }

    if datagram[0] != MAGIC {
        return Err(ProtocolError::BadMagic(datagram[0]));
    }

    if datagram[1] != SEQUENCE {
        return Err(ProtocolError::BadSequence(datagram[1]));
    }

    let declared = datagram[2] as usize;
    let actual = datagram.len() - HEADER_SIZE;
    if declared != actual {
        return Err(ProtocolError::SizeMismatch { declared, actual });
    }

    Ok(&datagram[HEADER_SIZE..])
}

/// Decodes one datagram.
///
/// # Errors
///
/// Returns [`ProtocolError`] for any header or per-type layout violation.
/// Unrecognised type bytes map to [`ProtocolError::UnknownMessageType`].
pub fn decode(datagram: &[u8]) -> Result<DecodedMessage, ProtocolError> {
    let content = content(datagram)?;

    let Some(&type_byte) = content.first() else {
        return Err(ProtocolError::TooShort {
            needed: HEADER_SIZE + 1,
            available: datagram.len(),
        });
    };

    let message_type = MessageType::from(type_byte);
    match message_type {
        MessageType::Unknown => return Err(ProtocolError::UnknownMessageType(type_byte)),
        MessageType::Info => {
            return Ok(if content.len() == 1 {
                DecodedMessage::InfoRequest
            } else {
                DecodedMessage::Info {
                    blob: content[1..].to_vec(),
                }
            });
        }
        _ => {}
    }

    if content.len() < PREFIX_SIZE {
        return Err(ProtocolError::UnexpectedSize {
            message_type,
            expected: PREFIX_SIZE,
            actual: content.len(),
        });
    }

    let client_id = content[1];
    let payload = &content[PREFIX_SIZE..];

    match message_type {
        MessageType::Connect => {
            expect_size(message_type, content, PREFIX_SIZE)?;
            Ok(DecodedMessage::Connect { client_id })
        }
        MessageType::Disconnect => {
            expect_size(message_type, content, PREFIX_SIZE + 2)?;
            Ok(DecodedMessage::Disconnect {
                client_id,
                mode: expect_mode(message_type, payload[0], PacketMode::Disconnect)?,
                disconnected_id: payload[1],
            })
        }
        MessageType::Alive => {
            expect_size(message_type, content, PREFIX_SIZE)?;
            Ok(DecodedMessage::Alive { client_id })
        }
        MessageType::Ping => {
            expect_size(message_type, content, PREFIX_SIZE)?;
            Ok(DecodedMessage::Ping { client_id })
        }
        MessageType::ClientsList => Ok(DecodedMessage::ClientsList {
            client_id,
            client_ids: payload.to_vec(),
        }),
        MessageType::Direct => Ok(DecodedMessage::Direct(decode_data(
            message_type,
            content,
            PacketMode::Direct,
        )?)),
        MessageType::Data => Ok(DecodedMessage::Data(decode_data(
            message_type,
            content,
            PacketMode::Data,
        )?)),
        MessageType::NameSet => decode_name_set(content),
        MessageType::Info | MessageType::Unknown => {
            unreachable!("handled before the common prefix is read")
        }
    }
}

/// Decodes one datagram and checks it is of the `expected` type.
pub fn decode_as(
    datagram: &[u8],
    expected: MessageType,
) -> Result<DecodedMessage, ProtocolError> {
    let message = decode(datagram)?;
    let actual = message.message_type();
    if actual != expected {
        return Err(ProtocolError::TypeMismatch { expected, actual });
    }
    Ok(message)
}

fn expect_size(
    message_type: MessageType,
    content: &[u8],
    expected: usize,
) -> Result<(), ProtocolError> {
    if content.len() != expected {
        return Err(ProtocolError::UnexpectedSize {
            message_type,
            expected,
            actual: content.len(),
        });
    }
    Ok(())
}

fn expect_mode(
    message_type: MessageType,
    byte: u8,
    expected: PacketMode,
) -> Result<PacketMode, ProtocolError> {
    let actual = PacketMode::try_from(byte)?;
    if actual != expected {
        return Err(ProtocolError::ModeMismatch {
            message_type,
            expected,
            actual,
        });
    }
    Ok(actual)
}

fn decode_data(
    message_type: MessageType,
    content: &[u8],
    mode: PacketMode,
) -> Result<Packet, ProtocolError> {
    if content.len() < DATA_PREFIX_SIZE {
        return Err(ProtocolError::UnexpectedSize {
            message_type,
            expected: DATA_PREFIX_SIZE,
            actual: content.len(),
        });
    }

    expect_mode(message_type, content[2], mode)?;

    let data_id = u32::from_be_bytes([content[4], content[5], content[6], content[7]]);
    Ok(Packet::new(
        content[1],
        content[3],
        data_id,
        mode,
        content[DATA_PREFIX_SIZE..].to_vec(),
    ))
}

fn decode_name_set(content: &[u8]) -> Result<DecodedMessage, ProtocolError> {
    if content.len() < NAME_SET_PREFIX_SIZE {
        return Err(ProtocolError::UnexpectedSize {
            message_type: MessageType::NameSet,
            expected: NAME_SET_PREFIX_SIZE,
            actual: content.len(),
        });
    }

    let name_len = u32::from_be_bytes([content[3], content[4], content[5], content[6]]) as usize;
    expect_size(
        MessageType::NameSet,
        content,
        NAME_SET_PREFIX_SIZE.saturating_add(name_len),
    )?;

    let name = std::str::from_utf8(&content[NAME_SET_PREFIX_SIZE..])
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_string();

    Ok(DecodedMessage::NameSet {
        sender_id: content[1],
        client_id: content[2],
        name,
    })
}

/// Readdresses an encoded DATA datagram in place for relaying.
///
/// Only the recipient client id byte and the source id byte change; the
/// payload is left untouched.
pub fn rewrite_relay(datagram: &mut [u8], recipient: u8, source: u8) -> Result<(), ProtocolError> {
    if datagram.len() < HEADER_SIZE + DATA_PREFIX_SIZE {
        return Err(ProtocolError::TooShort {
            needed: HEADER_SIZE + DATA_PREFIX_SIZE,
            available: datagram.len(),
        });
    }

    let actual = MessageType::from(datagram[HEADER_SIZE]);
    if actual != MessageType::Data {
        return Err(ProtocolError::TypeMismatch {
            expected: MessageType::Data,
            actual,
        });
    }

    datagram[CLIENT_ID_OFFSET] = recipient;
    datagram[SOURCE_ID_OFFSET] = source;
    Ok(())
}
