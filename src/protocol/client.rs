use super::{Message, TransportError};

/// Connection-side collaborator of the dispatcher.
///
/// Implementations own their synchronization; the dispatcher calls these
/// methods from worker threads without holding any lock.
pub trait Client: Send + Sync {
    /// Whether the client has yet to complete authentication.
    fn needs_auth(&self) -> bool;

    /// Queues `message` for transmission. An error means the connection is
    /// no longer usable.
    fn send_message(&self, message: Message) -> Result<(), TransportError>;

    /// Asks the connection layer to drop this client.
    fn close(&self) {}
}
