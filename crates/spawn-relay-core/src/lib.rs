//! spawn-relay-core: Shared protocol library for the spawn relay.
//!
//! Provides the JSON frame types exchanged over the relay's WebSocket
//! connections, the frame codec (including the bounded string-to-JSON
//! unwrap applied to daemon answers), HMAC identity tokens, and the
//! common error type.

pub mod codec;
pub mod error;
pub mod messages;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{decode_frame, encode_frame, unwrap_json_string};
pub use error::{RelayError, RelayResult};
pub use messages::{
    AckPayload, ClientKind, EventPayload, Frame, HelloPayload, RejectedPayload, RpcRequest,
    SpawnParams, SpawnReply, SpawnRequest, WelcomePayload, RPC_REQUEST_EVENT, SPAWN_EVENT,
    SPAWN_METHOD,
};
pub use token::{create_token, generate_secret, verify_token};
