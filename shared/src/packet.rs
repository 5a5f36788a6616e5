//! Application-facing packets and the typed payload encoding they carry
//!
//! The protocol layer never interprets a payload. Applications write values
//! with [`PayloadBuilder`] on the sending side and read them back in the same
//! order with the cursor readers on [`Packet`].
//!
//! All multi-byte values are big-endian. Strings are a 4-byte length followed
//! by UTF-8 bytes.

use crate::error::ProtocolError;

/// How a packet reached the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketMode {
    /// Point-to-point message terminated at the receiver
    Direct = 0,
    /// Broadcast message relayed through the server
    Data = 1,
    /// Notice that a peer left; carries no payload
    Disconnect = 2,
}

impl TryFrom<u8> for PacketMode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketMode::Direct),
            1 => Ok(PacketMode::Data),
            2 => Ok(PacketMode::Disconnect),
            other => Err(ProtocolError::UnknownMode(other)),
        }
    }
}

/// A decoded DATA, DIRECT, or DISCONNECT message ready for the application
///
/// The header fields never change after decoding. Only the read cursor moves
/// as typed values are consumed from the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    client_id: u8,
    source_client_id: u8,
    data_id: u32,
    mode: PacketMode,
    payload: Vec<u8>,
    position: usize,
}

impl Packet {
    pub fn new(
        client_id: u8,
        source_client_id: u8,
        data_id: u32,
        mode: PacketMode,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            client_id,
            source_client_id,
            data_id,
            mode,
            payload,
            position: 0,
        }
    }

    /// Builds the notice pushed to a channel when `client_id` leaves.
    pub fn disconnect(client_id: u8) -> Self {
        Self::new(client_id, client_id, 0, PacketMode::Disconnect, Vec::new())
    }

    /// Returns the same packet attributed to a different original sender.
    pub fn with_source(mut self, source_client_id: u8) -> Self {
        self.source_client_id = source_client_id;
        self
    }

    /// Id the receiver associates with the connection the packet arrived on
    pub fn client_id(&self) -> u8 {
        self.client_id
    }

    /// Id of the peer that originally sent the packet
    pub fn source_client_id(&self) -> u8 {
        self.source_client_id
    }

    pub fn data_id(&self) -> u32 {
        self.data_id
    }

    pub fn mode(&self) -> PacketMode {
        self.mode
    }

    /// Full payload, independent of the read cursor
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.position
    }

    fn take(&mut self, count: usize) -> Result<&[u8], ProtocolError> {
        if self.remaining() < count {
            return Err(ProtocolError::BufferUnderflow {
                needed: count,
                remaining: self.remaining(),
            });
        }

        let start = self.position;
        self.position += count;
        Ok(&self.payload[start..self.position])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(self.take(N)?);
        Ok(bytes)
    }

    pub fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_byte()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_be_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_be_bytes(self.take_array()?))
    }

    /// Reads a length-prefixed UTF-8 string.
    ///
    /// The cursor does not move if the length prefix points past the end of
    /// the payload.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let start = self.position;
        let length = u32::from_be_bytes(self.take_array()?) as usize;
        if self.remaining() < length {
            let remaining = self.remaining();
            self.position = start;
            return Err(ProtocolError::BufferUnderflow {
                needed: length,
                remaining,
            });
        }

        let bytes = self.take(length)?.to_vec();
        String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

/// Writes typed values in the layout [`Packet`] readers expect
#[derive(Debug, Default, Clone)]
pub struct PayloadBuilder {
    bytes: Vec<u8>,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn byte(mut self, value: u8) -> Self {
        self.bytes.push(value);
        self
    }

    pub fn bool(self, value: bool) -> Self {
        self.byte(value as u8)
    }

    pub fn i32(mut self, value: i32) -> Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn i64(mut self, value: i64) -> Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn f32(mut self, value: f32) -> Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn f64(mut self, value: f64) -> Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn string(mut self, value: &str) -> Self {
        self.bytes.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.bytes.extend_from_slice(value.as_bytes());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}
