//! Session setup and the streaming coordinator

pub mod coordinator;

pub use coordinator::{SessionControl, SessionState, SessionSummary, StreamCoordinator, Termination};

use crate::error::TransportError;
use crate::network::transport::TransportChannel;
use crate::protocol::ClientEvent;

/// Send `session.update` with the user's instructions and voice.
///
/// Empty instructions leave the remote defaults alone and send nothing.
pub fn send_instructions(
    transport: &dyn TransportChannel,
    instructions: &str,
    voice: &str,
) -> Result<bool, TransportError> {
    if instructions.is_empty() {
        tracing::info!("No instructions given, using remote defaults");
        return Ok(false);
    }

    transport.send(ClientEvent::session_update(instructions, voice).into())?;
    tracing::info!("Sent session instructions ({} bytes, voice {})", instructions.len(), voice);
    Ok(true)
}
