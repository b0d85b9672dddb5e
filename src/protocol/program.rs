//! Program dispatch.
//!
//! A [`Program`] binds a `{program, version}` pair to a [`ProcedureTable`] and turns decoded
//! [`Message`]s into handler calls. Every problem found while routing a call, from a bad
//! status to a failing handler, is answered with an ERROR reply carrying an [`RpcError`] and
//! the serial of the request. The only errors returned to the caller are transport errors
//! raised while sending, which mean the connection should be dropped.
//!
//! # Streams
//!
//! Stream packets are not acknowledged, so a client may keep sending data for a stream that
//! the server has already finished. Such packets are silently answered with an empty REPLY.
//! Outgoing stream data is framed by [`Program::send_stream_data`]:
//!
//! - `Some(data)` with data: `CONTINUE`, more to come.
//! - `Some(&[])`: `CONTINUE` with an empty payload, end of data but the stream is still open.
//! - `None`: `OK`, the stream is finished.
use bincode::encode_to_vec;
use log::{debug, info, warn};

use super::{
    Client, DispatchError, Header, Message, MessageStatus, MessageType, ProcedureTable,
    RpcError, TransportError, wire_config,
};

/// One `{program, version}` pair and the procedures it serves.
pub struct Program<S> {
    program: u32,
    version: u32,
    procedures: ProcedureTable<S>,
}

impl<S> Program<S> {
    pub fn new(program: u32, version: u32, procedures: ProcedureTable<S>) -> Self {
        Self {
            program,
            version,
            procedures,
        }
    }

    pub fn id(&self) -> u32 {
        self.program
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether `message` is addressed to this program. Versions must match
    /// exactly.
    pub fn matches(&self, message: &Message) -> bool {
        message.header.program == self.program && message.header.version == self.version
    }

    /// Whether `procedure` should be scheduled on the priority lane.
    pub fn priority(&self, procedure: i32) -> bool {
        self.procedures
            .get(procedure)
            .is_some_and(|procedure| procedure.priority())
    }

    /// Routes a fully header-decoded message.
    pub fn dispatch(
        &self,
        server: &S,
        client: &dyn Client,
        message: Message,
    ) -> Result<(), TransportError> {
        let header = message.header;

        let err = if header.program != self.program {
            DispatchError::ProgramMismatch {
                program: header.program,
                expected: self.program,
            }
        } else if header.version != self.version {
            DispatchError::VersionMismatch {
                version: header.version,
                expected: self.version,
            }
        } else {
            match header.kind {
                MessageType::Call => return self.dispatch_call(server, client, message),
                MessageType::Stream => {
                    info!(
                        "ignoring unexpected stream data serial={} proc={} status={:?}",
                        header.serial, header.procedure, header.status
                    );
                    let ack = message.recycle(header.answer(MessageType::Reply, MessageStatus::Ok));
                    return client.send_message(ack);
                }
                kind => DispatchError::UnexpectedType(kind),
            }
        };

        warn!("rejecting message serial={}: {err}", header.serial);
        self.send_reply_error(client, message, err.into(), &header)
    }

    fn dispatch_call(
        &self,
        server: &S,
        client: &dyn Client,
        message: Message,
    ) -> Result<(), TransportError> {
        let header = message.header;

        match self.call(server, client, &message) {
            Ok(ret) => {
                let reply = Message::with_body(
                    header.answer(MessageType::Reply, MessageStatus::Ok),
                    ret,
                );
                client.send_message(reply)
            }
            Err(e) => {
                warn!(
                    "call failed prog={:x} proc={} serial={}: {e}",
                    header.program, header.procedure, header.serial
                );
                self.send_reply_error(client, message, e.into(), &header)
            }
        }
    }

    fn call(
        &self,
        server: &S,
        client: &dyn Client,
        message: &Message,
    ) -> Result<Vec<u8>, DispatchError> {
        let header = &message.header;
        if header.status != MessageStatus::Ok {
            return Err(DispatchError::UnexpectedStatus(header.status));
        }

        let procedure = self
            .procedures
            .get(header.procedure)
            .ok_or(DispatchError::UnknownProcedure(header.procedure))?;

        if client.needs_auth() && procedure.needs_auth() {
            return Err(DispatchError::AuthRequired);
        }

        debug!(
            "dispatching {} serial={} prog={:x} vers={}",
            procedure.name(),
            header.serial,
            header.program,
            header.version
        );
        procedure.call(server, client, message)
    }

    /// Sends `error` as the REPLY to `request`.
    pub fn send_reply_error(
        &self,
        client: &dyn Client,
        message: Message,
        error: RpcError,
        request: &Header,
    ) -> Result<(), TransportError> {
        send_error(
            client,
            message,
            error,
            Header {
                program: self.program,
                version: self.version,
                ..*request
            },
            MessageType::Reply,
        )
    }

    /// Sends `error` framed as a stream packet so stream-aware clients route
    /// it to the stream rather than to a pending call.
    pub fn send_stream_error(
        &self,
        client: &dyn Client,
        message: Message,
        error: RpcError,
        request: &Header,
    ) -> Result<(), TransportError> {
        send_error(
            client,
            message,
            error,
            Header {
                program: self.program,
                version: self.version,
                ..*request
            },
            MessageType::Stream,
        )
    }

    /// Sends one packet of stream `serial`. See the module documentation for
    /// how `data` maps to a status.
    pub fn send_stream_data(
        &self,
        client: &dyn Client,
        procedure: i32,
        serial: i32,
        data: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        let status = match data {
            Some(_) => MessageStatus::Continue,
            None => MessageStatus::Ok,
        };
        let mut message = Message::new(Header {
            program: self.program,
            version: self.version,
            procedure,
            kind: MessageType::Stream,
            status,
            serial,
        });
        if let Some(data) = data {
            message.encode_payload_raw(data);
        }

        debug!(
            "stream data serial={serial} proc={procedure} len={} status={status:?}",
            message.len()
        );
        client.send_message(message)
    }
}

/// Answers a request whose program is not registered.
pub fn unknown_program(
    client: &dyn Client,
    message: Message,
    request: &Header,
) -> Result<(), TransportError> {
    let err = DispatchError::UnknownProgram {
        program: request.program,
        version: request.version,
    };
    warn!("{err}");
    send_error(client, message, err.into(), *request, MessageType::Reply)
}

fn send_error(
    client: &dyn Client,
    message: Message,
    error: RpcError,
    request: Header,
    kind: MessageType,
) -> Result<(), TransportError> {
    let payload = encode_to_vec(&error, wire_config()).inspect_err(|_| {
        warn!("failed to serialize remote error '{error}'");
    })?;

    let mut reply = message.recycle(request.answer(kind, MessageStatus::Error));
    reply.encode_payload_raw(&payload);
    client.send_message(reply)
}
