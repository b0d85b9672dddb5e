//! Procedure tables.
//!
//! A [`ProcedureTable`] lists the callable operations of one program. The position of a
//! [`Procedure`] in the table is its procedure number on the wire, so tables are built once at
//! startup and never reordered.
//!
//! Handlers are plain functions or closures over typed arguments:
//!
//! ```rust
//! use virtrpc::protocol::{Procedure, ProcedureTable, RpcError};
//!
//! struct Host {
//!     name: String,
//! }
//!
//! let table: ProcedureTable<Host> = ProcedureTable::new()
//!     .register(Procedure::new("ping", |_: &Host, _, _, (): ()| Ok::<_, RpcError>(())).without_auth())
//!     .register(Procedure::new("hostname", |host: &Host, _, _, (): ()| {
//!         Ok::<_, RpcError>(host.name.clone())
//!     }));
//!
//! assert_eq!(table.len(), 2);
//! assert!(table.get(1).unwrap().needs_auth());
//! assert!(table.get(2).is_none());
//! ```
use std::{fmt, marker::PhantomData};

use bincode::{Decode, Encode, encode_to_vec};

use super::{Client, DispatchError, Header, Message, RpcError, wire_config};

/// Type-erased argument decode, handler call and return encode.
trait Invoke<S>: Send + Sync {
    fn invoke(
        &self,
        server: &S,
        client: &dyn Client,
        request: &Message,
    ) -> Result<Vec<u8>, DispatchError>;
}

struct Typed<F, A, R> {
    handler: F,
    _codec: PhantomData<fn(A) -> R>,
}

impl<S, F, A, R> Invoke<S> for Typed<F, A, R>
where
    F: Fn(&S, &dyn Client, &Header, A) -> Result<R, RpcError> + Send + Sync,
    A: Decode<()>,
    R: Encode,
{
    fn invoke(
        &self,
        server: &S,
        client: &dyn Client,
        request: &Message,
    ) -> Result<Vec<u8>, DispatchError> {
        let args: A = request.decode_payload()?;
        let ret = (self.handler)(server, client, &request.header, args)?;
        encode_to_vec(&ret, wire_config()).map_err(DispatchError::Encode)
    }
}

/// One entry of a [`ProcedureTable`].
pub struct Procedure<S> {
    name: &'static str,
    needs_auth: bool,
    priority: bool,
    handler: Box<dyn Invoke<S>>,
}

impl<S> Procedure<S> {
    /// Creates a procedure that requires an authenticated client and runs on
    /// the regular lane.
    pub fn new<F, A, R>(name: &'static str, handler: F) -> Self
    where
        F: Fn(&S, &dyn Client, &Header, A) -> Result<R, RpcError> + Send + Sync + 'static,
        A: Decode<()> + 'static,
        R: Encode + 'static,
    {
        Self {
            name,
            needs_auth: true,
            priority: false,
            handler: Box::new(Typed {
                handler,
                _codec: PhantomData,
            }),
        }
    }

    /// Allows calls from clients that have not authenticated yet.
    pub fn without_auth(mut self) -> Self {
        self.needs_auth = false;
        self
    }

    /// Schedules calls on the priority lane of the worker pool.
    pub fn with_priority(mut self) -> Self {
        self.priority = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn needs_auth(&self) -> bool {
        self.needs_auth
    }

    pub fn priority(&self) -> bool {
        self.priority
    }

    /// Decodes the arguments held by `request`, runs the handler and returns
    /// the encoded result.
    pub(crate) fn call(
        &self,
        server: &S,
        client: &dyn Client,
        request: &Message,
    ) -> Result<Vec<u8>, DispatchError> {
        self.handler.invoke(server, client, request)
    }
}

impl<S> fmt::Debug for Procedure<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("name", &self.name)
            .field("needs_auth", &self.needs_auth)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Procedures of a program, indexed by procedure number.
#[derive(Debug)]
pub struct ProcedureTable<S> {
    procedures: Vec<Procedure<S>>,
}

impl<S> ProcedureTable<S> {
    pub fn new() -> Self {
        Self {
            procedures: Vec::new(),
        }
    }

    /// Appends `procedure`; it is assigned the next procedure number.
    pub fn register(mut self, procedure: Procedure<S>) -> Self {
        self.procedures.push(procedure);
        self
    }

    /// Looks up a procedure number; anything outside `[0, len)` is `None`.
    pub fn get(&self, procedure: i32) -> Option<&Procedure<S>> {
        usize::try_from(procedure)
            .ok()
            .and_then(|index| self.procedures.get(index))
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

impl<S> Default for ProcedureTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::{ErrorCode, TransportError};

    use super::*;

    struct Counter;

    struct NullClient;

    impl Client for NullClient {
        fn needs_auth(&self) -> bool {
            false
        }

        fn send_message(&self, _: Message) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn table() -> ProcedureTable<Counter> {
        ProcedureTable::new()
            .register(
                Procedure::new("add", |_: &Counter, _, _, (a, b): (u32, u32)| {
                    Ok::<_, RpcError>(a + b)
                })
                .without_auth()
                .with_priority(),
            )
            .register(Procedure::new("fail", |_: &Counter, _, _, (): ()| {
                Err::<(), _>(RpcError::handler(ErrorCode::OperationFailed, "no"))
            }))
    }

    #[test]
    fn lookup_bounds() {
        let table = table();

        assert_eq!(table.get(0).unwrap().name(), "add");
        assert_eq!(table.get(1).unwrap().name(), "fail");
        assert!(table.get(2).is_none());
        assert!(table.get(-1).is_none());
        assert!(table.get(i32::MIN).is_none());
    }

    #[test]
    fn flags() {
        let table = table();

        assert!(!table.get(0).unwrap().needs_auth());
        assert!(table.get(0).unwrap().priority());
        assert!(table.get(1).unwrap().needs_auth());
        assert!(!table.get(1).unwrap().priority());
    }

    #[test]
    fn call_decodes_and_encodes() {
        let table = table();
        let mut request = Message::new(Header::call(1, 1, 0, 1));
        request.encode_payload(&(2u32, 3u32)).unwrap();

        let ret = table
            .get(0)
            .unwrap()
            .call(&Counter, &NullClient, &request)
            .unwrap();
        let reply = Message::with_body(Header::default(), ret);
        assert_eq!(reply.decode_payload::<u32>().unwrap(), 5);
    }

    #[test]
    fn call_reports_decode_failure() {
        let table = table();
        let request = Message::with_body(Header::call(1, 1, 0, 1), vec![0, 1]);

        let err = table
            .get(0)
            .unwrap()
            .call(&Counter, &NullClient, &request)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Decode(_)));
    }

    #[test]
    fn call_reports_handler_failure() {
        let table = table();
        let request = Message::new(Header::call(1, 1, 1, 1));

        let err = table
            .get(1)
            .unwrap()
            .call(&Counter, &NullClient, &request)
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Handler(RpcError {
                code: ErrorCode::OperationFailed,
                ..
            })
        ));
    }
}
