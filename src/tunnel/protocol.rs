//! Tunnel frame codec
//!
//! Every WebSocket binary message carries one frame:
//!
//! ```text
//! varint id | varint conn_id | varint type | [varint deadline] | body
//! ```
//!
//! Varints are zig-zag signed LEB128. The deadline is present only on Data
//! and Connect frames and is ignored on receipt. Bodies are `proto/address`
//! for Connect, the client address for AddClient/RemoveClient, the error text
//! for Error and raw bytes for Data.

use thiserror::Error;

/// Longest address body accepted on Connect/AddClient/RemoveClient
const MAX_ADDRESS_LEN: usize = 100;

/// Error text signalling a clean close of one connection
pub const EOF_MESSAGE: &str = "EOF";

/// Frame decode failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input ended inside a varint
    #[error("truncated varint")]
    Truncated,
    /// Varint longer than 64 bits
    #[error("varint overflows 64 bits")]
    Overflow,
    /// Unknown frame type
    #[error("unknown frame type {0}")]
    UnknownType(i64),
    /// Connect body is not `proto/address`
    #[error("malformed connect body: {0}")]
    MalformedConnect(String),
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// Payload bytes for an open connection
    Data = 1,
    /// Open a connection
    Connect = 2,
    /// Close a connection, with a reason
    Error = 3,
    /// Register a client address
    AddClient = 4,
    /// Unregister a client address
    RemoveClient = 5,
    /// Stop reading from a connection
    Pause = 6,
    /// Resume reading from a connection
    Resume = 7,
    /// Reconcile open connection IDs
    SyncConnections = 8,
}

impl TryFrom<i64> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, ProtocolError> {
        Ok(match value {
            1 => MessageType::Data,
            2 => MessageType::Connect,
            3 => MessageType::Error,
            4 => MessageType::AddClient,
            5 => MessageType::RemoveClient,
            6 => MessageType::Pause,
            7 => MessageType::Resume,
            8 => MessageType::SyncConnections,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// One tunnel frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Sender-assigned message ID
    pub id: i64,
    /// Connection the frame belongs to
    pub conn_id: i64,
    /// Frame type
    pub kind: MessageType,
    /// Protocol, for Connect frames
    pub proto: String,
    /// Address, for Connect/AddClient/RemoveClient frames
    pub address: String,
    /// Payload for Data frames, error text for Error frames
    pub payload: Vec<u8>,
}

fn put_varint(buf: &mut Vec<u8>, value: i64) {
    let mut ux = (value as u64) << 1;
    if value < 0 {
        ux = !ux;
    }
    while ux >= 0x80 {
        buf.push((ux as u8) | 0x80);
        ux >>= 7;
    }
    buf.push(ux as u8);
}

fn read_varint(input: &[u8], pos: &mut usize) -> Result<i64, ProtocolError> {
    let mut ux: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *input.get(*pos).ok_or(ProtocolError::Truncated)?;
        *pos += 1;
        if shift == 63 && byte > 1 {
            return Err(ProtocolError::Overflow);
        }
        ux |= u64::from(byte & 0x7f) << shift;
        if byte < 0x80 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(ProtocolError::Overflow);
        }
    }
    let value = (ux >> 1) as i64;
    Ok(if ux & 1 != 0 { !value } else { value })
}

impl Frame {
    /// Frame of `kind` with an empty body
    pub(crate) fn new(id: i64, conn_id: i64, kind: MessageType) -> Self {
        Self {
            id,
            conn_id,
            kind,
            proto: String::new(),
            address: String::new(),
            payload: Vec::new(),
        }
    }

    /// Data frame
    pub fn data(id: i64, conn_id: i64, payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::new(id, conn_id, MessageType::Data)
        }
    }

    /// Connect frame
    pub fn connect(id: i64, conn_id: i64, proto: &str, address: &str) -> Self {
        Self {
            proto: proto.to_string(),
            address: address.to_string(),
            ..Self::new(id, conn_id, MessageType::Connect)
        }
    }

    /// Error frame closing `conn_id`
    pub fn error(id: i64, conn_id: i64, message: &str) -> Self {
        Self {
            payload: message.as_bytes().to_vec(),
            ..Self::new(id, conn_id, MessageType::Error)
        }
    }

    /// Error text of an Error frame
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Whether an Error frame reports a clean close
    pub fn is_eof(&self) -> bool {
        self.kind == MessageType::Error && self.payload == EOF_MESSAGE.as_bytes()
    }

    /// Encode for a binary WebSocket message
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24 + self.payload.len() + self.address.len());
        put_varint(&mut buf, self.id);
        put_varint(&mut buf, self.conn_id);
        put_varint(&mut buf, self.kind as i64);
        match self.kind {
            MessageType::Connect => {
                put_varint(&mut buf, 0);
                buf.extend_from_slice(self.proto.as_bytes());
                buf.push(b'/');
                buf.extend_from_slice(self.address.as_bytes());
            }
            MessageType::Data => {
                put_varint(&mut buf, 0);
                buf.extend_from_slice(&self.payload);
            }
            MessageType::AddClient | MessageType::RemoveClient => {
                buf.extend_from_slice(self.address.as_bytes());
            }
            _ => buf.extend_from_slice(&self.payload),
        }
        buf
    }

    /// Decode a binary WebSocket message
    pub fn decode(input: &[u8]) -> Result<Self, ProtocolError> {
        let mut pos = 0;
        let id = read_varint(input, &mut pos)?;
        let conn_id = read_varint(input, &mut pos)?;
        let kind = MessageType::try_from(read_varint(input, &mut pos)?)?;
        if matches!(kind, MessageType::Data | MessageType::Connect) {
            read_varint(input, &mut pos)?;
        }

        let body = &input[pos..];
        let mut frame = Self::new(id, conn_id, kind);
        match kind {
            MessageType::Connect => {
                let text = String::from_utf8_lossy(&body[..body.len().min(MAX_ADDRESS_LEN)]);
                let (proto, address) = text
                    .split_once('/')
                    .ok_or_else(|| ProtocolError::MalformedConnect(text.to_string()))?;
                frame.proto = proto.to_string();
                frame.address = address.to_string();
            }
            MessageType::AddClient | MessageType::RemoveClient => {
                frame.address =
                    String::from_utf8_lossy(&body[..body.len().min(MAX_ADDRESS_LEN)]).into_owned();
            }
            _ => frame.payload = body.to_vec(),
        }
        Ok(frame)
    }
}
