use std::io::{self, Read, Write};

use thiserror::Error;

use super::{HEADER_SIZE, Message};

/// Size of the length word that prefixes every packet.
pub const LEN_SIZE: usize = 4;

/// Largest packet accepted, length word included.
pub const MESSAGE_MAX: usize = 32 * 1024 * 1024;

/// Failures that make a connection unusable.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid packet length {0}")]
    Length(usize),
    #[error("connection closed")]
    Closed,
}

/// Length-prefixed framing of [`Message`]s over a byte stream.
///
/// Each packet is `[len: u32 BE][header][payload]` where `len` counts the
/// whole packet including itself.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn write_message(&mut self, message: &Message) -> Result<(), TransportError> {
        let bytes = message.to_bytes()?;
        let len = bytes.len() + LEN_SIZE;
        if len > MESSAGE_MAX {
            return Err(TransportError::Length(len));
        }

        self.stream.write_all(&(len as u32).to_be_bytes())?;
        self.stream.write_all(&bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Reads the next packet; [`TransportError::Closed`] on a clean EOF.
    pub fn read_message(&mut self) -> Result<Message, TransportError> {
        let mut len = [0u8; LEN_SIZE];
        match self.stream.read_exact(&mut len) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(TransportError::Closed),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len) as usize;
        if !(LEN_SIZE + HEADER_SIZE..=MESSAGE_MAX).contains(&len) {
            return Err(TransportError::Length(len));
        }

        let mut packet = vec![0u8; len - LEN_SIZE];
        self.stream.read_exact(&mut packet)?;
        Ok(Message::from_bytes(&packet)?)
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }
}
