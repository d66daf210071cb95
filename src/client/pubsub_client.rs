use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::broker::message::Message;

pub type ClientId = String;

/// A connection subscribed to a channel.
///
/// `ready_count` is the credit the consumer advertised: the channel only
/// pushes while it is positive and spends one unit per delivery.
/// `in_flight` counts messages delivered to this client and not yet
/// finished, requeued or timed out.
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub sender: UnboundedSender<Message>,
    pub ready_count: u64,
    pub in_flight: usize,
}

impl Client {
    /// Create a client with a fresh UUID and no credit.
    pub fn new(sender: UnboundedSender<Message>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), sender)
    }

    pub fn with_id(id: ClientId, sender: UnboundedSender<Message>) -> Self {
        Self {
            id,
            sender,
            ready_count: 0,
            in_flight: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready_count > 0
    }
}
