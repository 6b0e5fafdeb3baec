//! RPC over a daemon connection.
//!
//! A call is a single `rpc-request` event acknowledged by the daemon. Ack ids
//! come from the connection's [`Channel`](crate::transport::Channel); this
//! module only bounds the wait and decodes the answer.

use super::registry::ConnectionRecord;
use serde_json::{json, Value};
use spawn_relay_core::{unwrap_json_string, RelayError, RPC_REQUEST_EVENT};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Ceiling for a daemon to acknowledge an RPC.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no acknowledgment within {0:?}")]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Invoke `method` on the daemon behind `connection`.
///
/// `params` travel as JSON text. On timeout the request is abandoned: no
/// cancellation reaches the daemon, which may still act on it. The ack payload
/// goes through one [`unwrap_json_string`] pass, so a string answer that holds
/// JSON comes back parsed and any other string comes back as-is.
pub async fn call(
    connection: &ConnectionRecord,
    method: &str,
    params: &Value,
    timeout: Duration,
) -> Result<Value, RpcError> {
    let request = json!({
        "method": method,
        "params": params.to_string(),
    });

    debug!(
        conn_id = connection.id(),
        machine_id = ?connection.machine_id(),
        method,
        "sending rpc request"
    );

    let ack = tokio::time::timeout(
        timeout,
        connection.channel().emit_with_ack(RPC_REQUEST_EVENT, request),
    )
    .await;

    match ack {
        Ok(Ok(payload)) => Ok(unwrap_json_string(payload)),
        Ok(Err(RelayError::ChannelClosed)) => {
            warn!(conn_id = connection.id(), method, "rpc channel closed");
            Err(RpcError::Transport("channel closed".into()))
        }
        Ok(Err(e)) => {
            warn!(conn_id = connection.id(), method, error = %e, "rpc transport failure");
            Err(RpcError::Transport(e.to_string()))
        }
        Err(_) => {
            warn!(conn_id = connection.id(), method, ?timeout, "rpc timed out");
            Err(RpcError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::registry::tests::record;
    use crate::relay::registry::ConnectionRegistry;
    use spawn_relay_core::{Frame, RpcRequest};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Answer the first rpc request seen on `rx` with `answer`.
    fn answer_once(
        conn: Arc<ConnectionRecord>,
        mut rx: mpsc::Receiver<Frame>,
        answer: Value,
    ) -> tokio::task::JoinHandle<RpcRequest> {
        tokio::spawn(async move {
            match rx.recv().await {
                Some(Frame::Event(e)) => {
                    assert_eq!(e.name, RPC_REQUEST_EVENT);
                    let request: RpcRequest = serde_json::from_value(e.data).unwrap();
                    conn.channel().resolve_ack(e.id.unwrap(), answer);
                    request
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        })
    }

    #[tokio::test]
    async fn sends_method_and_stringified_params() {
        let registry = ConnectionRegistry::new();
        let (conn, rx) = record(&registry, "U1", Some("M1"));
        let daemon = answer_once(conn.clone(), rx, json!({ "ok": true }));

        let params = json!({ "directory": "/work", "machineId": "M1" });
        let result = call(&conn, "spawn-happy-session", &params, DEFAULT_RPC_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(result, json!({ "ok": true }));

        let request = daemon.await.unwrap();
        assert_eq!(request.method, "spawn-happy-session");
        let sent: Value = serde_json::from_str(&request.params).unwrap();
        assert_eq!(sent, params);
    }

    #[tokio::test]
    async fn string_ack_is_decoded_once() {
        let registry = ConnectionRegistry::new();
        let (conn, rx) = record(&registry, "U1", Some("M1"));
        let encoded = json!({ "ok": true, "result": "{\"type\":\"success\"}" }).to_string();
        answer_once(conn.clone(), rx, Value::String(encoded));

        let result = call(&conn, "m", &json!({}), DEFAULT_RPC_TIMEOUT).await.unwrap();
        assert_eq!(result["ok"], json!(true));
        // The inner result stays a string; unwrapping it is the caller's job.
        assert_eq!(result["result"], json!("{\"type\":\"success\"}"));
    }

    #[tokio::test]
    async fn opaque_string_ack_passes_through() {
        let registry = ConnectionRegistry::new();
        let (conn, rx) = record(&registry, "U1", Some("M1"));
        answer_once(conn.clone(), rx, json!("ciphertext=="));

        let result = call(&conn, "m", &json!({}), DEFAULT_RPC_TIMEOUT).await.unwrap();
        assert_eq!(result, json!("ciphertext=="));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_daemon_times_out() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = record(&registry, "U1", Some("M1"));

        let err = call(&conn, "m", &json!({}), DEFAULT_RPC_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(d) if d == DEFAULT_RPC_TIMEOUT));
        assert_eq!(conn.channel().pending_acks(), 0);
    }

    #[tokio::test]
    async fn closed_channel_is_transport_error() {
        let registry = ConnectionRegistry::new();
        let (conn, rx) = record(&registry, "U1", Some("M1"));
        drop(rx);

        let err = call(&conn, "m", &json!({}), DEFAULT_RPC_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }
}
