//! WebSocket transport
//!
//! Accepts TCP connections, upgrades them to WebSocket and runs one task per
//! connection. Each task multiplexes three event sources:
//! - inbound frames, decoded as `ClientMessage` and applied to a `Connection`
//! - deliveries pushed by the subscribed channel, written as `message` frames
//! - a heartbeat tick that sends `heartbeat` and drops clients that stayed
//!   silent for two intervals
//!
//! When the task ends for any reason the `Connection` is closed, which
//! requeues whatever it still had in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{Broker, Message};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::transport::protocol::{Connection, ProtocolError};

/// Bind `addr` and serve until the listener fails to bind.
pub async fn start_websocket_server(addr: String, broker: Arc<Broker>) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on ws://{addr}");
    serve(listener, broker).await
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        if broker.is_closed() {
            info!("broker closed, no longer accepting connections");
            return Ok(());
        }

        let broker = broker.clone();
        tokio::spawn(async move {
            debug!(%peer, "accepted connection");
            handle_connection(stream, broker).await;
        });
    }
}

/// Run the protocol over one stream until it closes.
pub async fn handle_connection<S>(stream: S, broker: Arc<Broker>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let mut conn = Connection::new(broker.clone(), tx);

    let interval = Duration::from_millis(broker.settings().heartbeat_interval_ms.max(1));
    let mut heartbeat =
        tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        conn.touch_activity();
                        continue;
                    }
                    Some(Err(e)) => {
                        debug!(client = conn.id(), "read failed: {e}");
                        break;
                    }
                };

                let result = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(cmd) => conn.handle(cmd),
                    Err(e) => Err(ProtocolError::BadMessage(e.to_string())),
                };
                match result {
                    Ok(Some(reply)) => {
                        if send(&mut ws_sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(client = conn.id(), code = e.code(), "{e}");
                        let fatal = e.is_fatal();
                        if send(&mut ws_sender, &e.to_response()).await.is_err() || fatal {
                            break;
                        }
                    }
                }
            }

            Some(msg) = rx.recv() => {
                if send(&mut ws_sender, &ServerMessage::from(&msg)).await.is_err() {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if conn.is_idle(Instant::now(), interval * 2) {
                    warn!(client = conn.id(), "no activity for two heartbeat intervals, closing");
                    break;
                }
                if send(&mut ws_sender, &ServerMessage::Heartbeat).await.is_err() {
                    break;
                }
            }
        }
    }

    conn.close();
    let _ = ws_sender.close().await;
}

async fn send<S>(sink: &mut S, msg: &ServerMessage) -> Result<(), tungstenite::Error>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            error!("failed to serialize reply: {e}");
            return Ok(());
        }
    };
    sink.send(WsMessage::text(text)).await
}
