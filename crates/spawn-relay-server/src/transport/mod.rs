//! Connection transport: WebSocket listener and the per-connection channel.

pub mod channel;
pub mod websocket;

pub use channel::{Channel, Responder};
