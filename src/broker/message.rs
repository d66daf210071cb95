//! Message definitions for the broker
//!
//! A `Message` is created once by a topic on publish and then copied into
//! every channel of that topic. The body is immutable and shared by
//! reference across those copies; `attempts` belongs to each copy and is
//! advanced independently by the channel that requeues it.
//!
//! Notes on fields:
//! - `id`: assigned at topic ingress, never regenerated by a channel
//! - `body`: opaque payload bytes
//! - `timestamp`: milliseconds since UNIX epoch, set when the topic accepted it
//! - `attempts`: 1 on first delivery, +1 on every requeue
//!
//! Overflow records use a fixed layout, big-endian:
//! `timestamp (8) | attempts (2) | id (16) | body (..)`.

use std::sync::Arc;

use crate::broker::id::{ID_LEN, MessageId};
use crate::utils::{BrokerError, Result};

const HEADER_LEN: usize = 8 + 2 + ID_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub body: Arc<[u8]>,
    pub timestamp: i64,
    pub attempts: u16,
}

impl Message {
    /// Wrap a payload with a fresh ID and the current time.
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            id: MessageId::generate(),
            body: body.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            attempts: 1,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.body.len());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.attempts.to_be_bytes());
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(BrokerError::Corrupt(format!(
                "record of {} bytes is shorter than the {HEADER_LEN} byte header",
                bytes.len()
            )));
        }
        let (ts, rest) = bytes.split_at(8);
        let (attempts, rest) = rest.split_at(2);
        let (id, body) = rest.split_at(ID_LEN);

        let mut ts_buf = [0u8; 8];
        ts_buf.copy_from_slice(ts);
        let mut attempts_buf = [0u8; 2];
        attempts_buf.copy_from_slice(attempts);
        let mut id_buf = [0u8; ID_LEN];
        id_buf.copy_from_slice(id);

        Ok(Self {
            id: MessageId::from_bytes(id_buf),
            body: body.into(),
            timestamp: i64::from_be_bytes(ts_buf),
            attempts: u16::from_be_bytes(attempts_buf),
        })
    }
}
