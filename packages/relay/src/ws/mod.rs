//! Relay WebSocket
//!
//! Every text frame a client sends is fanned out to all other connected
//! clients, never back to the sender.

mod dispatch;
mod handler;
mod registry;

pub use handler::handle_relay_ws;
pub use registry::ConnectionRegistry;
