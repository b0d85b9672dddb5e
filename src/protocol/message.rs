//! Wire message envelope.
//!
//! Every packet exchanged with a client is a [`Message`]: a fixed [`Header`] followed by a
//! procedure-specific payload. The header layout is part of the wire contract:
//!
//! | field       | type  |
//! |-------------|-------|
//! | `program`   | `u32` |
//! | `version`   | `u32` |
//! | `procedure` | `i32` |
//! | `kind`      | [`MessageType`] encoded as `u32` |
//! | `status`    | [`MessageStatus`] encoded as `u32` |
//! | `serial`    | `i32` |
//!
//! All integers are big-endian and fixed width, giving a 24 byte header.
use bincode::{Decode, Encode, decode_from_slice, encode_into_slice, encode_to_vec};

use super::{DispatchError, wire_config};

/// Encoded size of a [`Header`].
pub const HEADER_SIZE: usize = 24;

/// Direction and role of a message.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub enum MessageType {
    /// Client to server request expecting a reply.
    #[default]
    Call,
    /// Server answer to a `Call`.
    Reply,
    /// Asynchronous event, not correlated with a request.
    Message,
    /// Packet on a data stream attached to a call.
    Stream,
}

/// Outcome carried by a message.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub enum MessageStatus {
    #[default]
    Ok,
    Error,
    /// More stream packets will follow.
    Continue,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct Header {
    pub program: u32,
    pub version: u32,
    pub procedure: i32,
    pub kind: MessageType,
    pub status: MessageStatus,
    pub serial: i32,
}

impl Header {
    pub fn call(program: u32, version: u32, procedure: i32, serial: i32) -> Self {
        Self {
            program,
            version,
            procedure,
            kind: MessageType::Call,
            status: MessageStatus::Ok,
            serial,
        }
    }

    /// Builds a header answering `self`, keeping the correlating fields
    /// (program, version, procedure, serial).
    pub fn answer(&self, kind: MessageType, status: MessageStatus) -> Self {
        Self {
            kind,
            status,
            ..*self
        }
    }

    pub fn encode(&self) -> Result<[u8; HEADER_SIZE], bincode::error::EncodeError> {
        let mut buf = [0u8; HEADER_SIZE];
        encode_into_slice(self, &mut buf, wire_config())?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (header, _) = decode_from_slice(bytes, wire_config())?;
        Ok(header)
    }
}

/// A header together with its payload bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    body: Vec<u8>,
}

impl Message {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            body: Vec::new(),
        }
    }

    pub fn with_body(header: Header, body: Vec<u8>) -> Self {
        Self { header, body }
    }

    /// Turns this message into an empty one carrying `header`.
    ///
    /// The payload allocation is kept so a request buffer can be recycled
    /// for its reply.
    pub fn recycle(mut self, header: Header) -> Self {
        self.header = header;
        self.body.clear();
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Appends `value` to the payload.
    pub fn encode_payload<T: Encode>(&mut self, value: &T) -> Result<(), DispatchError> {
        let bytes = encode_to_vec(value, wire_config()).map_err(DispatchError::Encode)?;
        self.body.extend_from_slice(&bytes);
        Ok(())
    }

    /// Appends raw bytes to the payload without any framing.
    pub fn encode_payload_raw(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    pub fn decode_payload<T: Decode<()>>(&self) -> Result<T, DispatchError> {
        let (value, _) = decode_from_slice(&self.body, wire_config()).map_err(DispatchError::Decode)?;
        Ok(value)
    }

    /// Header followed by payload, without the length prefix.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.len());
        out.extend_from_slice(&self.header.encode()?);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let header = Header::decode(bytes)?;
        let body = bytes.get(HEADER_SIZE..).unwrap_or_default().to_vec();
        Ok(Self { header, body })
    }
}
