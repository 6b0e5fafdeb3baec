//! The relay server: accepts WebSocket connections, runs the handshake,
//! registers each connection, and dispatches its events.

use crate::config::ServerConfig;
use crate::handshake::{self, verify_hello};
use crate::relay::{ConnectionRecord, ConnectionRegistry, SpawnOrchestrator};
use crate::transport::websocket::{self, WebSocketConnection};
use crate::transport::{Channel, Responder};
use serde_json::{json, Value};
use spawn_relay_core::{
    EventPayload, Frame, RelayError, RelayResult, SpawnReply, SpawnRequest, SPAWN_EVENT,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Ack data for a `session:spawn` whose payload is not a spawn request.
pub const INVALID_SPAWN_REQUEST: &str = "invalid spawn request";

/// How long shutdown waits for connections to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<TcpStream>;

/// The spawn relay server.
pub struct RelayServer {
    config: ServerConfig,
    /// Live connections, shared with the orchestrator.
    registry: Arc<ConnectionRegistry>,
    orchestrator: Arc<SpawnOrchestrator>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

/// A server whose listener is bound but not yet serving.
pub struct BoundServer {
    server: Arc<RelayServer>,
    local_addr: SocketAddr,
    ws_rx: mpsc::Receiver<WebSocketConnection>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let orchestrator = Arc::new(SpawnOrchestrator::new(
            registry.clone(),
            config.rpc_timeout,
        ));
        Self {
            config,
            registry,
            orchestrator,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Bind the WebSocket listener.
    pub async fn bind(self) -> RelayResult<BoundServer> {
        let (local_addr, ws_rx) =
            websocket::start_listener(self.config.listen_addr, self.config.max_frame_size)
                .await?;
        Ok(BoundServer {
            server: Arc::new(self),
            local_addr,
            ws_rx,
        })
    }

    async fn handle_websocket(
        self: Arc<Self>,
        conn: WebSocketConnection,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> RelayResult<()> {
        let WebSocketConnection {
            mut ws_stream,
            remote_addr,
        } = conn;
        debug!(remote = %remote_addr, "handling WebSocket connection");

        let first = tokio::time::timeout(
            self.config.hello_timeout,
            websocket::recv_frame(&mut ws_stream, self.config.max_frame_size),
        )
        .await;
        let hello = match first {
            Ok(Ok(Some(Frame::Hello(hello)))) => hello,
            Ok(Ok(Some(_))) => {
                let err = RelayError::InvalidMessage("expected hello as first frame".into());
                return reject(&mut ws_stream, err).await;
            }
            Ok(Ok(None)) => {
                return Err(RelayError::Transport("connection closed before hello".into()));
            }
            Ok(Err(e)) => return reject(&mut ws_stream, e).await,
            Err(_) => return reject(&mut ws_stream, RelayError::Timeout).await,
        };

        let auth = match verify_hello(&hello, &self.config.auth) {
            Ok(auth) => auth,
            Err(e) => return reject(&mut ws_stream, e).await,
        };

        let conn_id = self.registry.next_id();
        let (channel, mut outbound_rx) = Channel::pair();
        let record = Arc::new(ConnectionRecord::new(
            conn_id,
            auth.identity,
            auth.kind,
            channel,
        ));

        // Registered before the welcome goes out, so a peer that has seen
        // its welcome is already routable.
        self.registry.register(record.clone());
        let result = match websocket::send_frame(&mut ws_stream, &handshake::build_welcome(conn_id))
            .await
        {
            Ok(()) => {
                info!(
                    remote = %remote_addr,
                    conn_id,
                    identity = %record.identity(),
                    machine_id = ?record.machine_id(),
                    "connection established"
                );
                self.connection_loop(&mut ws_stream, &record, &mut outbound_rx, &mut shutdown_rx)
                    .await
            }
            Err(e) => Err(e),
        };

        self.retire(&record, outbound_rx);
        let _ = ws_stream.close(None).await;

        info!(conn_id, "connection closed");
        result
    }

    async fn connection_loop(
        &self,
        ws_stream: &mut WsStream,
        record: &Arc<ConnectionRecord>,
        outbound_rx: &mut mpsc::Receiver<Frame>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> RelayResult<()> {
        let conn_id = record.id();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(conn_id, "shutdown signal received, closing connection");
                    break;
                }

                Some(frame) = outbound_rx.recv() => {
                    websocket::send_frame(ws_stream, &frame).await?;
                }

                incoming = websocket::recv_frame(ws_stream, self.config.max_frame_size) => {
                    match incoming {
                        Ok(Some(frame)) => self.dispatch_frame(record, frame),
                        Ok(None) => {
                            debug!(conn_id, "peer closed");
                            break;
                        }
                        Err(RelayError::InvalidMessage(msg)) => {
                            warn!(conn_id, %msg, "dropping malformed frame");
                        }
                        Err(e) => {
                            debug!(conn_id, error = %e, "connection ended");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Take a finished connection out of service.
    ///
    /// The record leaves the registry while its channel still accepts sends;
    /// only then is the channel closed and its outbound queue dropped.
    fn retire(&self, record: &ConnectionRecord, outbound_rx: mpsc::Receiver<Frame>) {
        self.registry.unregister(record.id());
        record.channel().close();
        drop(outbound_rx);
    }

    /// Route one inbound frame. Never blocks the connection loop: anything
    /// that answers the peer runs in its own task.
    fn dispatch_frame(&self, record: &Arc<ConnectionRecord>, frame: Frame) {
        match frame {
            Frame::Ack(ack) => {
                if !record.channel().resolve_ack(ack.id, ack.data) {
                    debug!(conn_id = record.id(), ack_id = ack.id, "late or unknown ack dropped");
                }
            }
            Frame::Event(event) => self.handle_event(record, event),
            other => {
                warn!(conn_id = record.id(), frame = ?other, "unexpected frame after handshake");
            }
        }
    }

    fn handle_event(&self, record: &Arc<ConnectionRecord>, event: EventPayload) {
        let EventPayload { name, id, data } = event;

        if name == SPAWN_EVENT {
            let Some(id) = id else {
                warn!(conn_id = record.id(), "session:spawn without ack id ignored");
                return;
            };
            let orchestrator = self.orchestrator.clone();
            let record = record.clone();
            tokio::spawn(async move {
                let reply = match parse_spawn_request(data) {
                    Some(request) => orchestrator
                        .spawn(record.identity(), request)
                        .await
                        .into_reply(),
                    None => {
                        warn!(conn_id = record.id(), "invalid spawn request");
                        SpawnReply {
                            ok: false,
                            error: Some(INVALID_SPAWN_REQUEST.into()),
                            ..Default::default()
                        }
                    }
                };
                let data = match serde_json::to_value(&reply) {
                    Ok(data) => data,
                    Err(e) => {
                        error!(error = %e, "failed to encode spawn reply");
                        json!({ "ok": false, "error": "internal error" })
                    }
                };
                if let Err(e) = Responder::new(id).respond(record.channel(), data).await {
                    debug!(conn_id = record.id(), error = %e, "client gone before spawn reply");
                }
            });
            return;
        }

        match id {
            Some(id) => {
                debug!(conn_id = record.id(), event = %name, "unknown event");
                let record = record.clone();
                tokio::spawn(async move {
                    let data = json!({ "ok": false, "error": format!("unknown event: {name}") });
                    let _ = Responder::new(id).respond(record.channel(), data).await;
                });
            }
            None => debug!(conn_id = record.id(), event = %name, "ignoring unknown event"),
        }
    }
}

impl BoundServer {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` resolves, then close every
    /// connection and wait (bounded) for them to finish.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let local_addr = self.local_addr();
        let BoundServer {
            server, mut ws_rx, ..
        } = self;
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        info!(
            addr = %local_addr,
            rpc_timeout = ?server.config.rpc_timeout,
            require_token = server.config.auth.require_token,
            "spawn relay ready"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                Some(ws_conn) = ws_rx.recv() => {
                    let srv = server.clone();
                    let shutdown_rx = server.shutdown_tx.subscribe();
                    connections.spawn(async move {
                        if let Err(e) = srv.handle_websocket(ws_conn, shutdown_rx).await {
                            warn!(error = %e, "WebSocket connection error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                else => {
                    info!("listener closed, shutting down");
                    break;
                }
            }
        }

        info!(
            connections = server.registry.count(),
            "closing connected clients"
        );
        let _ = server.shutdown_tx.send(());
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("connections still open after grace period, aborting");
            connections.abort_all();
        }
    }
}

/// Answer a failed handshake with `rejected` and close.
async fn reject(ws_stream: &mut WsStream, err: RelayError) -> RelayResult<()> {
    let _ = websocket::send_frame(ws_stream, &handshake::build_rejected(&err.to_string())).await;
    let _ = ws_stream.close(None).await;
    Err(err)
}

fn parse_spawn_request(data: Value) -> Option<SpawnRequest> {
    let request: SpawnRequest = serde_json::from_value(data).ok()?;
    if request.directory.trim().is_empty() {
        return None;
    }
    Some(request)
}
