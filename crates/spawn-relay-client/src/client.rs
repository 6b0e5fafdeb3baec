//! The relay client.
//!
//! `RelayClient` owns the connection lifecycle: WebSocket connect, the
//! hello/welcome handshake, ack correlation for outgoing events, and delivery
//! of incoming events.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use spawn_relay_core::{
    decode_frame, encode_frame, AckPayload, EventPayload, Frame, HelloPayload, RelayError,
    RelayResult, RpcRequest, SpawnReply, SpawnRequest, RPC_REQUEST_EVENT, SPAWN_EVENT,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// Client-side timeouts.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for `welcome` after sending `hello`.
    pub hello_timeout: Duration,
    /// How long [`RelayClient::spawn_session`] waits for its ack. Should exceed
    /// the relay's RPC timeout so the relay's own failure reply arrives first.
    pub spawn_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hello_timeout: Duration::from_secs(10),
            spawn_timeout: Duration::from_secs(35),
        }
    }
}

/// An event received from the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingEvent {
    pub name: String,
    /// Set when the relay expects an [`RelayClient::ack`].
    pub id: Option<u64>,
    pub data: Value,
}

/// One authenticated connection to the relay.
pub struct RelayClient {
    connection_id: u64,
    config: ClientConfig,
    /// Frames waiting for the writer task.
    outgoing_tx: mpsc::Sender<Frame>,
    /// Acks we are waiting for, keyed by event id.
    pending: PendingAcks,
    next_ack_id: AtomicU64,
    events_rx: Mutex<mpsc::Receiver<IncomingEvent>>,
    connected: Arc<AtomicBool>,
    reader_handle: Option<tokio::task::JoinHandle<()>>,
    writer_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RelayClient {
    /// Connect to `url` and complete the handshake.
    ///
    /// A `rejected` answer surfaces as [`RelayError::AuthFailed`].
    pub async fn connect(
        url: &str,
        hello: HelloPayload,
        config: ClientConfig,
    ) -> RelayResult<Self> {
        let (mut ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| RelayError::Transport(format!("websocket connect: {e}")))?;

        let connection_id =
            match time::timeout(config.hello_timeout, handshake(&mut ws, hello)).await {
                Ok(result) => result?,
                Err(_) => return Err(RelayError::Timeout),
            };
        tracing::debug!(connection_id, "connected to relay");

        let (sink, stream) = ws.split();
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Frame>(256);
        let (events_tx, events_rx) = mpsc::channel::<IncomingEvent>(256);
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let writer_handle = tokio::spawn(write_loop(sink, outgoing_rx));
        let reader_handle = tokio::spawn(read_loop(
            stream,
            pending.clone(),
            events_tx,
            connected.clone(),
        ));

        Ok(Self {
            connection_id,
            config,
            outgoing_tx,
            pending,
            next_ack_id: AtomicU64::new(1),
            events_rx: Mutex::new(events_rx),
            connected,
            reader_handle: Some(reader_handle),
            writer_handle: Some(writer_handle),
        })
    }

    /// Connection id assigned by the relay.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether the relay side is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Emit an event that expects no acknowledgment.
    pub async fn emit(&self, name: &str, data: Value) -> RelayResult<()> {
        self.send(Frame::Event(EventPayload {
            name: name.to_string(),
            id: None,
            data,
        }))
        .await
    }

    /// Emit an event and wait up to `timeout` for its acknowledgment.
    pub async fn emit_with_ack(
        &self,
        name: &str,
        data: Value,
        timeout: Duration,
    ) -> RelayResult<Value> {
        let id = self.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = Frame::Event(EventPayload {
            name: name.to_string(),
            id: Some(id),
            data,
        });
        if let Err(e) = self.send(frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(RelayError::ChannelClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RelayError::Timeout)
            }
        }
    }

    /// Acknowledge an incoming event.
    pub async fn ack(&self, id: u64, data: Value) -> RelayResult<()> {
        self.send(Frame::Ack(AckPayload { id, data })).await
    }

    /// Next event from the relay; `None` once the connection is gone.
    pub async fn next_event(&self) -> Option<IncomingEvent> {
        self.events_rx.lock().await.recv().await
    }

    /// Ask the relay to spawn a session in `directory`.
    ///
    /// Relay-side failures come back as a reply with `ok == false`; only
    /// transport problems are errors.
    pub async fn spawn_session(
        &self,
        directory: &str,
        machine_id: Option<&str>,
    ) -> RelayResult<SpawnReply> {
        let request = SpawnRequest {
            directory: directory.to_string(),
            machine_id: machine_id.map(str::to_string),
        };
        let data = serde_json::to_value(&request)?;
        let ack = self
            .emit_with_ack(SPAWN_EVENT, data, self.config.spawn_timeout)
            .await?;
        Ok(serde_json::from_value(ack)?)
    }

    /// Answer `rpc-request` events with `handler` until the connection closes.
    ///
    /// The handler's value is sent back as the ack data unchanged. Other
    /// events are ignored.
    pub async fn serve_rpc<F, Fut>(&self, mut handler: F) -> RelayResult<()>
    where
        F: FnMut(RpcRequest) -> Fut,
        Fut: Future<Output = Value>,
    {
        while let Some(event) = self.next_event().await {
            if event.name != RPC_REQUEST_EVENT {
                tracing::debug!(name = %event.name, "ignoring event");
                continue;
            }
            let Some(id) = event.id else {
                tracing::warn!("rpc request without ack id");
                continue;
            };

            let answer = match serde_json::from_value::<RpcRequest>(event.data) {
                Ok(request) => {
                    tracing::debug!(method = %request.method, "handling rpc request");
                    handler(request).await
                }
                Err(e) => {
                    tracing::warn!("malformed rpc request: {}", e);
                    json!({ "ok": false, "error": "invalid rpc request" })
                }
            };
            self.ack(id, answer).await?;
        }
        Ok(())
    }

    /// Close the connection. Pending acks fail with [`RelayError::ChannelClosed`].
    pub async fn close(mut self) {
        self.connected.store(false, Ordering::Release);
        if let Some(writer) = self.writer_handle.take() {
            // Dropping our sender lets the writer send a close frame and exit.
            let (closed_tx, _) = mpsc::channel(1);
            drop(std::mem::replace(&mut self.outgoing_tx, closed_tx));
            let _ = writer.await;
        }
        self.pending.lock().await.clear();
    }

    async fn send(&self, frame: Frame) -> RelayResult<()> {
        self.outgoing_tx
            .send(frame)
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some(h) = self.reader_handle.take() {
            h.abort();
        }
        if let Some(h) = self.writer_handle.take() {
            h.abort();
        }
    }
}

/// Send `hello`, wait for `welcome`.
async fn handshake(ws: &mut WsStream, hello: HelloPayload) -> RelayResult<u64> {
    let text = encode_frame(&Frame::Hello(hello))?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| RelayError::Transport(e.to_string()))?;

    loop {
        let msg = ws
            .next()
            .await
            .ok_or_else(|| RelayError::Transport("connection closed during handshake".into()))?
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => {
                return Err(RelayError::Transport("connection closed during handshake".into()))
            }
            _ => continue,
        };
        return match decode_frame(text.as_str())? {
            Frame::Welcome(welcome) => Ok(welcome.connection_id),
            Frame::Rejected(rejected) => Err(RelayError::AuthFailed(rejected.reason)),
            other => Err(RelayError::InvalidMessage(format!(
                "expected welcome, got {other:?}"
            ))),
        };
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outgoing_rx: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = outgoing_rx.recv().await {
        let text = match encode_frame(&frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("failed to encode frame: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            tracing::debug!("websocket send failed: {}", e);
            return;
        }
    }
    let _ = sink.close().await;
    tracing::debug!("writer loop ended");
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    pending: PendingAcks,
    events_tx: mpsc::Sender<IncomingEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("websocket receive failed: {}", e);
                break;
            }
        };

        match decode_frame(text.as_str()) {
            Ok(Frame::Ack(ack)) => {
                let waiter = pending.lock().await.remove(&ack.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(ack.data);
                    }
                    None => tracing::debug!(id = ack.id, "ack for unknown or expired event"),
                }
            }
            Ok(Frame::Event(event)) => {
                let incoming = IncomingEvent {
                    name: event.name,
                    id: event.id,
                    data: event.data,
                };
                if events_tx.send(incoming).await.is_err() {
                    break;
                }
            }
            Ok(other) => tracing::debug!("ignoring frame after handshake: {:?}", other),
            Err(e) => tracing::warn!("bad frame from relay: {}", e),
        }
    }

    connected.store(false, Ordering::Release);
    // Dropping the senders fails every outstanding emit_with_ack.
    pending.lock().await.clear();
    tracing::debug!("reader loop ended");
}
