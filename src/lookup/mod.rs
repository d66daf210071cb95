//! Discovery collaborator interface.
//!
//! The daemon periodically pushes a snapshot of its topics and channels to
//! registry peers. The push is one-way: peers never send commands back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Broker;

/// One `{topic, channel}` pair this daemon serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub topic: String,
    pub channel: Option<String>,
}

/// The full snapshot pushed to a peer on every tick.
#[derive(Debug, Clone, Serialize)]
pub struct Announcement {
    pub address: String,
    pub version: String,
    pub registrations: Vec<Registration>,
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("connection to lookup peer failed: {0}")]
    Connect(#[from] tungstenite::Error),

    #[error("failed to encode announcement: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A registry node that accepts announcements.
pub trait LookupPeer: Send + Sync {
    fn address(&self) -> &str;

    fn announce(
        &self,
        announcement: &Announcement,
    ) -> impl Future<Output = Result<(), LookupError>> + Send;
}

/// Peer reached over WebSocket: one connection per announcement, carrying a
/// single JSON text frame.
#[derive(Debug, Clone)]
pub struct WebSocketPeer {
    address: String,
}

impl WebSocketPeer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl LookupPeer for WebSocketPeer {
    fn address(&self) -> &str {
        &self.address
    }

    async fn announce(&self, announcement: &Announcement) -> Result<(), LookupError> {
        let body = serde_json::to_string(announcement)?;
        let (mut ws, _) = connect_async(format!("ws://{}", self.address)).await?;
        ws.send(WsMessage::text(body)).await?;
        ws.close(None).await?;
        Ok(())
    }
}

/// Announce `broker.registrations()` to every peer each `interval` until
/// the broker closes. Failures are logged and retried on the next tick.
pub async fn start_announce_loop<P: LookupPeer>(
    broker: Arc<Broker>,
    peers: Vec<P>,
    daemon_address: String,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if broker.is_closed() {
            break;
        }
        let announcement = Announcement {
            address: daemon_address.clone(),
            version: crate::VERSION.to_string(),
            registrations: broker.registrations(),
        };
        for peer in &peers {
            match peer.announce(&announcement).await {
                Ok(()) => debug!(
                    peer = peer.address(),
                    count = announcement.registrations.len(),
                    "announced"
                ),
                Err(e) => warn!(peer = peer.address(), "announce failed: {e}"),
            }
        }
    }
}
