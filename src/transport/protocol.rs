//! Per-connection protocol state machine.
//!
//! `Connection` turns decoded client commands into topic and channel
//! operations. It owns no socket, so the websocket layer (and tests) drive it
//! directly.
//!
//! States: `Connected -> Identified -> Subscribed <-> Delivering`, plus
//! `Closing` once the client announced it is leaving. Whatever the state,
//! dropping or closing the connection requeues every message it still holds
//! in flight: an abrupt disconnect counts as a failure, never as success.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::{Broker, Channel, Message};
use crate::client::{Client, ClientId};
use crate::transport::message::{ClientMessage, PROTOCOL_VERSION, ServerMessage};
use crate::utils::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Identified,
    Subscribed,
    Delivering,
    Closing,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid command: {0}")]
    Invalid(String),

    #[error("bad message: {0}")]
    BadMessage(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Invalid(_) => "E_INVALID",
            ProtocolError::BadMessage(_) => "E_BAD_MESSAGE",
            ProtocolError::UnsupportedVersion(_) => "E_BAD_PROTOCOL",
            ProtocolError::Broker(e) => match e {
                BrokerError::QueueFull(_) | BrokerError::Io(_) => "E_PUB_FAILED",
                BrokerError::NotInFlight(_) => "E_NOT_IN_FLIGHT",
                BrokerError::TopicNotFound(_) | BrokerError::ChannelNotFound { .. } => {
                    "E_NOT_FOUND"
                }
                BrokerError::InvalidName(_) => "E_BAD_NAME",
                BrokerError::MessageTooLarge { .. } => "E_BAD_MESSAGE",
                BrokerError::InvalidDelay { .. } | BrokerError::UnknownClient(_) => "E_INVALID",
                BrokerError::Closed(_) => "E_CLOSED",
                BrokerError::Corrupt(_) => "E_INTERNAL",
            },
        }
    }

    /// Fatal errors are reported and then the connection is closed.
    pub fn is_fatal(&self) -> bool {
        match self {
            ProtocolError::Invalid(_)
            | ProtocolError::BadMessage(_)
            | ProtocolError::UnsupportedVersion(_) => true,
            ProtocolError::Broker(e) => matches!(
                e,
                BrokerError::Closed(_) | BrokerError::UnknownClient(_) | BrokerError::InvalidName(_)
            ),
        }
    }

    pub fn to_response(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

pub struct Connection {
    id: ClientId,
    broker: Arc<Broker>,
    state: ConnectionState,
    client_name: Option<String>,
    subscription: Option<Arc<Channel>>,
    deliveries: UnboundedSender<Message>,
    last_activity: Instant,
    closed: bool,
}

impl Connection {
    /// `deliveries` is where the subscribed channel pushes messages for this
    /// connection.
    pub fn new(broker: Arc<Broker>, deliveries: UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            broker,
            state: ConnectionState::Connected,
            client_name: None,
            subscription: None,
            deliveries,
            last_activity: Instant::now(),
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscription(&self) -> Option<&Arc<Channel>> {
        self.subscription.as_ref()
    }

    /// Apply one command. `Ok(Some(_))` carries a reply for the client.
    pub fn handle(&mut self, msg: ClientMessage) -> Result<Option<ServerMessage>, ProtocolError> {
        self.touch_activity();

        match msg {
            ClientMessage::Nop => Ok(None),

            ClientMessage::Identify {
                version,
                client_name,
            } => {
                if self.state != ConnectionState::Connected {
                    return Err(ProtocolError::Invalid("already identified".into()));
                }
                if version != PROTOCOL_VERSION {
                    return Err(ProtocolError::UnsupportedVersion(version));
                }
                info!(client = %self.id, name = ?client_name, "client identified");
                self.client_name = client_name;
                self.state = ConnectionState::Identified;
                let settings = self.broker.settings();
                Ok(Some(ServerMessage::Identified {
                    version: PROTOCOL_VERSION,
                    max_ready_count: settings.max_ready_count,
                    msg_timeout_ms: settings.msg_timeout_ms,
                    heartbeat_interval_ms: settings.heartbeat_interval_ms,
                }))
            }

            _ if self.state == ConnectionState::Connected => {
                Err(ProtocolError::Invalid("must identify first".into()))
            }

            ClientMessage::Publish { topic, payload } => {
                if self.state == ConnectionState::Closing {
                    return Err(ProtocolError::Invalid("cannot publish while closing".into()));
                }
                let message_id = self.broker.publish(&topic, payload)?;
                debug!(client = %self.id, topic = %topic, id = %message_id, "published");
                Ok(Some(ServerMessage::Published { message_id }))
            }

            ClientMessage::Subscribe { topic, channel } => {
                if self.state != ConnectionState::Identified {
                    return Err(ProtocolError::Invalid(
                        "cannot subscribe in current state".into(),
                    ));
                }
                let ch = self.broker.get_channel(&topic, &channel)?;
                ch.add_client(Client::with_id(self.id.clone(), self.deliveries.clone()))?;
                self.subscription = Some(ch);
                self.state = ConnectionState::Subscribed;
                Ok(Some(ServerMessage::Ok))
            }

            ClientMessage::Ready { count } => {
                if self.state == ConnectionState::Closing {
                    return Err(ProtocolError::Invalid("cannot raise ready count while closing".into()));
                }
                let max = self.broker.settings().max_ready_count;
                if count > max {
                    return Err(ProtocolError::Invalid(format!(
                        "ready count {count} exceeds the maximum of {max}"
                    )));
                }
                self.channel()?.set_ready(&self.id, count)?;
                self.state = if count > 0 {
                    ConnectionState::Delivering
                } else {
                    ConnectionState::Subscribed
                };
                Ok(None)
            }

            ClientMessage::Finish { message_id } => {
                self.channel()?.finish(&self.id, &message_id)?;
                Ok(None)
            }

            ClientMessage::Requeue {
                message_id,
                delay_ms,
            } => {
                self.channel()?
                    .requeue(&self.id, &message_id, Duration::from_millis(delay_ms))?;
                Ok(None)
            }

            ClientMessage::Touch { message_id } => {
                self.channel()?.touch(&self.id, &message_id)?;
                Ok(None)
            }

            ClientMessage::Close => {
                if let Some(ch) = &self.subscription {
                    if let Err(e) = ch.set_ready(&self.id, 0) {
                        debug!(client = %self.id, "could not withdraw credit on close: {e}");
                    }
                }
                self.state = ConnectionState::Closing;
                Ok(Some(ServerMessage::CloseWait))
            }
        }
    }

    fn channel(&self) -> Result<&Arc<Channel>, ProtocolError> {
        self.subscription
            .as_ref()
            .ok_or_else(|| ProtocolError::Invalid("not subscribed".into()))
    }

    pub fn touch_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// True when nothing arrived from the client for longer than `limit`.
    pub fn is_idle(&self, now: Instant, limit: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > limit
    }

    /// Leave the channel, requeueing everything still in flight. Returns how
    /// many messages were requeued. Safe to call more than once.
    pub fn close(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;
        info!(client = %self.id, name = ?self.client_name, "connection closed");
        match self.subscription.take() {
            Some(ch) => ch.remove_client(&self.id),
            None => 0,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
