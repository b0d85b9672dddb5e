//! RPC dispatch protocol.
//!
//! This module implements how a decoded request is routed, executed and answered. The
//! connection layer reads packets off the wire, turns them into [`Message`]s and hands them to
//! an [`RpcServer`], which picks the matching [`Program`] and schedules the call on a
//! [`WorkerPool`](crate::thread::WorkerPool).
//!
//! # Overview
//!
//! A service is described by a [`Program`]: a `{program, version}` pair plus a
//! [`ProcedureTable`]. Each [`Procedure`] carries a typed handler, whether it may be called
//! by a client that has not authenticated yet, and whether it belongs on the priority lane.
//!
//! Handlers run with no lock held by this layer. They receive the server state, the calling
//! [`Client`], the request [`Header`] and their decoded arguments, and return either a value
//! to encode into the reply or an [`RpcError`].
//!
//! # Binary Format
//!
//! Headers, arguments, return values and errors are encoded with bincode using big-endian,
//! fixed-width integers, which gives XDR compatible layouts for the integer and enum types
//! used here:
//!
//! - Each packet starts with a 4 byte length that counts the whole packet.
//! - A 24 byte [`Header`] follows.
//! - The payload follows, encoded according to the procedure's argument or return type, or an
//!   [`RpcError`] when the header status is `Error`.
//!
//! # Errors
//!
//! Problems with a single message ([`DispatchError`]) are always answered on the same
//! connection with an error reply that carries the request serial. Only a failure to send
//! ([`TransportError`]) is returned to the caller.
use bincode::config::{BigEndian, Configuration, Fixint};

mod client;
mod error;
mod message;
mod procedure;
mod program;
mod server;
mod transport;

pub use client::Client;
pub use error::{DispatchError, ErrorCode, ErrorDomain, ErrorLevel, RpcError};
pub use message::{HEADER_SIZE, Header, Message, MessageStatus, MessageType};
pub use procedure::{Procedure, ProcedureTable};
pub use program::{Program, unknown_program};
pub use server::{Job, RpcServer};
pub use transport::{LEN_SIZE, MESSAGE_MAX, ProtocolTransport, TransportError};

/// Encoding shared by every part of a packet.
pub(crate) fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}
