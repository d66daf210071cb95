//! The `transport` module handles network communication with clients over
//! WebSockets: the JSON command set, the per-connection protocol state
//! machine, and the server that binds the two to sockets.

pub mod message;
pub mod protocol;
pub mod websocket;

#[cfg(test)]
mod tests;

pub use message::{ClientMessage, PROTOCOL_VERSION, ServerMessage};
pub use protocol::{Connection, ConnectionState, ProtocolError};
pub use websocket::{serve, start_websocket_server};
