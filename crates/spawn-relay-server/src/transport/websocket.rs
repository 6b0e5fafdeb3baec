//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, upgrades them to WebSocket, and hands them to the
//! server over an mpsc channel. Frames are JSON text messages.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use spawn_relay_core::{decode_frame, encode_frame, Frame, RelayError, RelayResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, trace, warn};

/// Accepted connections queued ahead of the server loop.
const ACCEPT_BACKLOG: usize = 64;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address (useful with port 0) and a receiver that yields
/// accepted connections. Messages larger than `max_message_size` are refused
/// by tungstenite while reading. The listener closes once the receiver is
/// dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
    max_message_size: usize,
) -> RelayResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(ACCEPT_BACKLOG);
    let ws_config = ws_config(max_message_size);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => {
                    debug!("server stopped accepting, listener exiting");
                    break;
                }
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config))
                            .await
                        {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

fn ws_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

/// Send one frame as a text message.
pub async fn send_frame<S>(sink: &mut S, frame: &Frame) -> RelayResult<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let text = encode_frame(frame)?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| RelayError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next frame.
///
/// Returns `None` once the peer closes. Binary and control messages are
/// skipped; pings are answered by tungstenite itself. Text messages larger
/// than `max_frame_size` are rejected.
pub async fn recv_frame<S>(stream: &mut S, max_frame_size: usize) -> RelayResult<Option<Frame>>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > max_frame_size {
                    return Err(RelayError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {})",
                        text.len(),
                        max_frame_size
                    )));
                }
                return decode_frame(text.as_str()).map(Some);
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(other)) => {
                trace!(kind = ?std::mem::discriminant(&other), "skipping non-text message");
                continue;
            }
            Some(Err(e)) => {
                return Err(RelayError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
