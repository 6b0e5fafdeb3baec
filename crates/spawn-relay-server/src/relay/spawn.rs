//! Session spawn orchestration.
//!
//! Picks a daemon connection for the requesting identity, invokes
//! `spawn-happy-session` on it, and folds whatever comes back (or doesn't)
//! into a [`SpawnOutcome`]. `spawn` itself never fails: every error, timeout
//! and panic ends up as [`SpawnOutcome::Failure`].

use super::registry::{ConnectionRecord, ConnectionRegistry};
use super::rpc::{self, RpcError};
use futures_util::FutureExt;
use serde_json::Value;
use spawn_relay_core::{
    unwrap_json_string, SpawnParams, SpawnReply, SpawnRequest, SPAWN_METHOD,
};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Error text a web client sees when a directory needs approval first.
pub const APPROVAL_REQUIRED_MESSAGE: &str = "Directory creation requires approval";

/// Result of one spawn request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    Success { session_id: String },
    /// The daemon wants a human to confirm creating `directory`.
    NeedsApproval { directory: String },
    Failure { reason: String },
}

impl SpawnOutcome {
    fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    /// Wire form acknowledged to the web client.
    pub fn into_reply(self) -> SpawnReply {
        match self {
            SpawnOutcome::Success { session_id } => SpawnReply {
                ok: true,
                session_id: Some(session_id),
                ..Default::default()
            },
            SpawnOutcome::NeedsApproval { directory } => SpawnReply {
                ok: false,
                error: Some(APPROVAL_REQUIRED_MESSAGE.to_string()),
                directory: Some(directory),
                ..Default::default()
            },
            SpawnOutcome::Failure { reason } => SpawnReply {
                ok: false,
                error: Some(reason),
                ..Default::default()
            },
        }
    }
}

/// Why a spawn did not produce a session.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("identity {0} has no connection and no daemon is connected")]
    NoConnection(String),

    #[error("no machine-scoped connection matches machine {0:?}")]
    NoMachineAvailable(Option<String>),

    #[error("rpc timed out after {0:?}")]
    RpcTimeout(Duration),

    #[error("rpc transport failure: {0}")]
    RpcTransportFailure(String),

    #[error("daemon reported: {0}")]
    DaemonReportedError(String),

    #[error("malformed daemon response: {0}")]
    MalformedResponse(String),

    #[error("internal fault")]
    InternalFault,
}

impl SpawnError {
    /// Reason handed back to the web client.
    pub fn reason(&self) -> String {
        match self {
            SpawnError::NoConnection(_) | SpawnError::NoMachineAvailable(_) => {
                "no daemon available".to_string()
            }
            SpawnError::RpcTimeout(_) | SpawnError::RpcTransportFailure(_) => {
                "daemon RPC timeout or error".to_string()
            }
            SpawnError::DaemonReportedError(reason) | SpawnError::MalformedResponse(reason) => {
                reason.clone()
            }
            SpawnError::InternalFault => "internal error".to_string(),
        }
    }
}

impl From<RpcError> for SpawnError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Timeout(d) => SpawnError::RpcTimeout(d),
            RpcError::Transport(msg) => SpawnError::RpcTransportFailure(msg),
        }
    }
}

/// Routes spawn requests from clients to daemons.
pub struct SpawnOrchestrator {
    registry: Arc<ConnectionRegistry>,
    rpc_timeout: Duration,
    /// Makes the next attempts panic mid-pipeline.
    #[cfg(test)]
    fault: std::sync::atomic::AtomicBool,
}

impl SpawnOrchestrator {
    pub fn new(registry: Arc<ConnectionRegistry>, rpc_timeout: Duration) -> Self {
        Self {
            registry,
            rpc_timeout,
            #[cfg(test)]
            fault: std::sync::atomic::AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_fault(&self, on: bool) {
        self.fault.store(on, std::sync::atomic::Ordering::SeqCst);
    }

    /// Pick the daemon connection that should serve a spawn for `identity`.
    ///
    /// The identity's own machine-scoped connections are scanned first, then
    /// every machine-scoped connection in the process (daemons may run under
    /// a different identity than the web client). Within each pass the first
    /// connection in registration order whose machine id matches wins;
    /// `machine_id == None` matches any daemon.
    pub fn select(
        &self,
        identity: &str,
        machine_id: Option<&str>,
    ) -> Result<Arc<ConnectionRecord>, SpawnError> {
        let eligible = |record: &Arc<ConnectionRecord>| match (record.machine_id(), machine_id) {
            (Some(_), None) => true,
            (Some(have), Some(want)) => have == want,
            (None, _) => false,
        };

        let own = self.registry.connections_for(identity);
        if let Some(record) = own.iter().find(|r| eligible(r)) {
            return Ok(record.clone());
        }

        let pool = self.registry.all_machine_scoped();
        if let Some(record) = pool.iter().find(|r| eligible(r)) {
            info!(
                identity,
                daemon_identity = %record.identity(),
                machine_id = ?record.machine_id(),
                "using daemon from another identity"
            );
            return Ok(record.clone());
        }

        if own.is_empty() && pool.is_empty() {
            Err(SpawnError::NoConnection(identity.to_string()))
        } else {
            Err(SpawnError::NoMachineAvailable(machine_id.map(str::to_string)))
        }
    }

    /// Spawn a session for `identity`. Always yields an outcome.
    pub async fn spawn(&self, identity: &str, request: SpawnRequest) -> SpawnOutcome {
        info!(
            identity,
            directory = %request.directory,
            machine_id = request.machine_id.as_deref().unwrap_or("any"),
            "spawn requested"
        );

        let attempt = AssertUnwindSafe(self.try_spawn(identity, &request))
            .catch_unwind()
            .await;

        match attempt {
            Ok(Ok(outcome)) => {
                info!(identity, outcome = ?outcome, "spawn finished");
                outcome
            }
            Ok(Err(e)) => {
                warn!(identity, error = %e, "spawn failed");
                SpawnOutcome::failure(e.reason())
            }
            Err(_) => {
                error!(identity, "spawn panicked");
                SpawnOutcome::failure(SpawnError::InternalFault.reason())
            }
        }
    }

    async fn try_spawn(
        &self,
        identity: &str,
        request: &SpawnRequest,
    ) -> Result<SpawnOutcome, SpawnError> {
        let target = self.select(identity, request.machine_id.as_deref())?;
        #[cfg(test)]
        if self.fault.load(std::sync::atomic::Ordering::SeqCst) {
            panic!("spawn fault on connection {}", target.id());
        }
        let params = SpawnParams {
            directory: request.directory.clone(),
            machine_id: target.machine_id().unwrap_or_default().to_string(),
        };
        let params = serde_json::to_value(&params).map_err(|_| SpawnError::InternalFault)?;
        let payload = rpc::call(&target, SPAWN_METHOD, &params, self.rpc_timeout).await?;
        interpret(payload)
    }
}

/// Turn a decoded `spawn-happy-session` answer into an outcome.
///
/// Expected shape: `{ok, result, error?}` where `result` may itself be JSON
/// text, unwrapped at most once, holding `{type, ...}`.
pub fn interpret(payload: Value) -> Result<SpawnOutcome, SpawnError> {
    let Value::Object(envelope) = payload else {
        return Err(SpawnError::MalformedResponse("RPC call failed".into()));
    };

    let ok = envelope.get("ok").and_then(Value::as_bool).unwrap_or(false);
    let result = envelope.get("result").filter(|v| !v.is_null());
    let Some(result) = result.filter(|_| ok) else {
        let reason = envelope
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("RPC call failed");
        return Err(SpawnError::DaemonReportedError(reason.to_string()));
    };

    let Value::Object(inner) = unwrap_json_string(result.clone()) else {
        return Err(SpawnError::MalformedResponse("unknown spawn error".into()));
    };

    let text = |key: &str| inner.get(key).and_then(Value::as_str).map(str::to_string);

    match inner.get("type").and_then(Value::as_str) {
        Some("success") => match text("sessionId") {
            Some(session_id) => Ok(SpawnOutcome::Success { session_id }),
            None => Err(SpawnError::MalformedResponse(
                "daemon reported success without a session id".into(),
            )),
        },
        Some("requestToApproveDirectoryCreation") => match text("directory") {
            Some(directory) => Ok(SpawnOutcome::NeedsApproval { directory }),
            None => Err(SpawnError::MalformedResponse(
                "approval request without a directory".into(),
            )),
        },
        _ => Err(SpawnError::DaemonReportedError(
            text("error").unwrap_or_else(|| "unknown spawn error".to_string()),
        )),
    }
}
