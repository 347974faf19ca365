//! Blocking message channel to the remote endpoint

use crate::error::TransportError;
use crate::protocol::Envelope;

/// Bidirectional, message-framed connection
///
/// Both directions may be used from different threads at once. No retry
/// or reconnection happens at this level: any error ends the session.
pub trait TransportChannel: Send + Sync {
    /// Transmit one message
    fn send(&self, message: Envelope) -> Result<(), TransportError>;

    /// Block until the next message arrives, or the connection ends
    fn receive(&self) -> Result<Envelope, TransportError>;

    /// Close the connection and wake a blocked `receive`. Idempotent.
    fn close(&self);
}
