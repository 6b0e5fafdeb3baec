//! Connection handshake.
//!
//! 1. Client sends `hello` with its identity, kind and (optionally) a token
//! 2. Server answers `welcome` with the connection id, or `rejected`
//!
//! The identity bound here is what every later request on the connection
//! runs as.

use crate::relay::ConnectionKind;
use spawn_relay_core::{
    verify_token, ClientKind, Frame, HelloPayload, RejectedPayload, RelayError, RelayResult,
    WelcomePayload,
};
use tracing::debug;

/// Token checking policy for incoming hellos.
#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    /// HMAC secret identity tokens are signed with.
    pub token_secret: Option<Vec<u8>>,
    /// Reject hellos that carry no valid token.
    pub require_token: bool,
}

/// Identity and kind established by a successful hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub identity: String,
    pub kind: ConnectionKind,
}

/// Validate a `hello` frame.
pub fn verify_hello(hello: &HelloPayload, policy: &AuthPolicy) -> RelayResult<Authenticated> {
    let identity = hello.identity.trim();
    if identity.is_empty() {
        return Err(RelayError::InvalidMessage("hello without identity".into()));
    }

    match (&hello.token, &policy.token_secret) {
        (Some(token), Some(secret)) => {
            verify_token(secret, identity, token)
                .map_err(|e| RelayError::AuthFailed(e.to_string()))?;
        }
        (None, _) if policy.require_token => {
            return Err(RelayError::AuthFailed("identity token required".into()));
        }
        (Some(_), None) if policy.require_token => {
            return Err(RelayError::AuthFailed("no token secret configured".into()));
        }
        _ => {
            debug!(identity, "accepting hello without token verification");
        }
    }

    let kind = match hello.kind {
        ClientKind::Plain => ConnectionKind::Plain,
        ClientKind::MachineScoped => match hello.machine_id.as_deref().map(str::trim) {
            Some(machine_id) if !machine_id.is_empty() => ConnectionKind::MachineScoped {
                machine_id: machine_id.to_string(),
            },
            _ => {
                return Err(RelayError::InvalidMessage(
                    "machine-scoped hello without machineId".into(),
                ));
            }
        },
    };

    Ok(Authenticated {
        identity: identity.to_string(),
        kind,
    })
}

/// Build a `welcome` frame.
pub fn build_welcome(connection_id: u64) -> Frame {
    Frame::Welcome(WelcomePayload { connection_id })
}

/// Build a `rejected` frame.
pub fn build_rejected(reason: &str) -> Frame {
    Frame::Rejected(RejectedPayload {
        reason: reason.to_string(),
    })
}
