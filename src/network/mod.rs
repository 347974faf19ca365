//! Network subsystem: the connection to the realtime endpoint

pub mod transport;
pub mod websocket;

pub use transport::TransportChannel;
pub use websocket::WsTransport;
