use bincode::{Decode, Encode};
use thiserror::Error;

use super::{MessageStatus, MessageType};

/// Error codes understood by clients.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ErrorCode {
    Internal,
    /// Generic protocol level failure.
    Rpc,
    /// Only sent by handlers; the dispatcher reports missing authentication
    /// as [`ErrorCode::Rpc`] so that older clients can still parse it.
    AuthFailed,
    NoSupport,
    InvalidArg,
    OperationFailed,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ErrorDomain {
    Rpc,
    Remote,
    Handler,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ErrorLevel {
    Warning,
    Error,
}

/// Structured error sent back to a client as the payload of an ERROR reply.
#[derive(Debug, Clone, Error, Encode, Decode, PartialEq, Eq)]
#[error("[{domain:?}][{code:?}] {}", .message.as_deref().unwrap_or("unknown error"))]
pub struct RpcError {
    pub code: ErrorCode,
    pub domain: ErrorDomain,
    pub message: Option<String>,
    pub level: ErrorLevel,
}

impl RpcError {
    pub fn new(code: ErrorCode, domain: ErrorDomain, message: impl Into<String>) -> Self {
        Self {
            code,
            domain,
            message: Some(message.into()),
            level: ErrorLevel::Error,
        }
    }

    /// Error raised by a procedure handler.
    pub fn handler(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, ErrorDomain::Handler, message)
    }

    /// Marks the error as a warning; clients log it but keep the call result.
    pub fn warning(mut self) -> Self {
        self.level = ErrorLevel::Warning;
        self
    }

    fn rpc(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Rpc, ErrorDomain::Rpc, message)
    }
}

/// Everything that can go wrong while routing a single message.
///
/// None of these are fatal for the connection: they are all turned into
/// an [`RpcError`] reply.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("program mismatch (actual {program:x}, expected {expected:x})")]
    ProgramMismatch { program: u32, expected: u32 },

    #[error("version mismatch (actual {version:x}, expected {expected:x})")]
    VersionMismatch { version: u32, expected: u32 },

    #[error("cannot find program {program} version {version}")]
    UnknownProgram { program: u32, version: u32 },

    #[error("unexpected message type {0:?}")]
    UnexpectedType(MessageType),

    #[error("unexpected message status {0:?}")]
    UnexpectedStatus(MessageStatus),

    #[error("unknown procedure: {0}")]
    UnknownProcedure(i32),

    #[error("authentication required")]
    AuthRequired,

    #[error("unable to decode message payload: {0}")]
    Decode(bincode::error::DecodeError),

    #[error("unable to encode message payload: {0}")]
    Encode(bincode::error::EncodeError),

    #[error(transparent)]
    Handler(#[from] RpcError),
}

impl From<DispatchError> for RpcError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Handler(err) => err,
            // AuthRequired included: it must stay ErrorCode::Rpc.
            err => RpcError::rpc(err.to_string()),
        }
    }
}
