//! spawn-relay-client: client library for the spawn relay.
//!
//! A [`RelayClient`] holds one authenticated WebSocket connection to the
//! relay. Web clients use it to ask for sessions ([`RelayClient::spawn_session`]);
//! daemons use it to answer the relay's RPC requests ([`RelayClient::serve_rpc`]).
//!
//! # Example
//!
//! ```no_run
//! use spawn_relay_client::{ClientConfig, RelayClient};
//! use spawn_relay_core::HelloPayload;
//!
//! # async fn example() -> spawn_relay_core::RelayResult<()> {
//! let client = RelayClient::connect(
//!     "ws://localhost:3005",
//!     HelloPayload::plain("user-1"),
//!     ClientConfig::default(),
//! )
//! .await?;
//! let reply = client.spawn_session("/work", None).await?;
//! println!("ok={} session={:?}", reply.ok, reply.session_id);
//! # Ok(())
//! # }
//! ```

pub mod client;

pub use client::{ClientConfig, IncomingEvent, RelayClient};
