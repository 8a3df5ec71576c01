//! Connection runtime (component C8): WebSocket handshake, frame codec,
//! connection registry, and the per-connection worker loop.

pub mod connection;
pub mod frame;
pub mod handshake;
pub mod worker;

pub use connection::{ConnectionHandle, ConnectionRegistry, ConnectionState, Delivery};
