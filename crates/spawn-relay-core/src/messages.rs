//! Relay wire protocol.
//!
//! Every WebSocket text message carries exactly one JSON [`Frame`], tagged by
//! its `type` field. After the `hello` / `welcome` handshake both sides
//! exchange named `event` frames; an event carrying an `id` expects exactly one
//! `ack` frame with the same id in return.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event a web client emits to ask for a new daemon-spawned session.
pub const SPAWN_EVENT: &str = "session:spawn";

/// Event the relay emits on a daemon connection to invoke one of its RPC methods.
pub const RPC_REQUEST_EVENT: &str = "rpc-request";

/// Daemon RPC method that spawns a session in a directory.
pub const SPAWN_METHOD: &str = "spawn-happy-session";

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Hello(HelloPayload),
    Welcome(WelcomePayload),
    Rejected(RejectedPayload),
    Event(EventPayload),
    Ack(AckPayload),
}

/// What kind of peer is on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientKind {
    /// A plain user connection (e.g. a web client).
    Plain,
    /// A daemon controlling a specific machine.
    MachineScoped,
}

/// First frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    /// Identity token issued for `identity`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub identity: String,
    pub kind: ClientKind,
    /// Required when `kind` is machine-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
}

impl HelloPayload {
    /// Hello for a plain (web client) connection.
    pub fn plain(identity: impl Into<String>) -> Self {
        Self {
            token: None,
            identity: identity.into(),
            kind: ClientKind::Plain,
            machine_id: None,
        }
    }

    /// Hello for a daemon controlling `machine_id`.
    pub fn machine(identity: impl Into<String>, machine_id: impl Into<String>) -> Self {
        Self {
            token: None,
            identity: identity.into(),
            kind: ClientKind::MachineScoped,
            machine_id: Some(machine_id.into()),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub connection_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedPayload {
    pub reason: String,
}

/// A named event. `id` is set when the sender expects an acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

/// The acknowledgment of the event with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub id: u64,
    #[serde(default)]
    pub data: Value,
}

/// Data of a `session:spawn` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub directory: String,
    /// Target machine; any machine-scoped daemon is eligible when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
}

/// Acknowledgment data of a `session:spawn` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

/// Data of an `rpc-request` event.
///
/// `params` is JSON text: daemons may wrap their parameters in an extra
/// encryption layer, so the relay never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: String,
}

/// Parameters of the `spawn-happy-session` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnParams {
    pub directory: String,
    pub machine_id: String,
}
