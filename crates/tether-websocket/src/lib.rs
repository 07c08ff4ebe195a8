#![deny(unsafe_code)]

//! WebSocket transports for the tether RFC runtime.
//!
//! One server accepts many clients; one connector dials one server. Both
//! run the shared communicator core from `tether-session` over text
//! frames; only the handshake and framing live here.
//!
//! Handshake: the client's first text frame is its header envelope
//! `{"header":H}`; the server's acceptance handler either replies with the
//! empty-object confirmation and enters OPEN, or closes the socket with a
//! WebSocket close code.

mod connector;
mod server;
mod transport;

pub use connector::WsConnector;
pub use server::{WsAcceptor, WsServer};
pub use transport::WsTransport;
