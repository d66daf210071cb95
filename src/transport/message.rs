//! Wire protocol: JSON text frames tagged by `type`.
//!
//! Every client command maps one-to-one onto a topic or channel operation.
//! Payloads are opaque bytes and travel base64-encoded.

use serde::{Deserialize, Serialize};

use crate::broker::MessageId;

/// Version spoken by this server, returned on `identify`.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "identify")]
    Identify {
        version: u32,
        #[serde(default)]
        client_name: Option<String>,
    },
    #[serde(rename = "publish")]
    Publish {
        topic: String,
        #[serde(with = "base64_payload")]
        payload: Vec<u8>,
    },
    #[serde(rename = "subscribe")]
    Subscribe { topic: String, channel: String },
    #[serde(rename = "ready")]
    Ready { count: u64 },
    #[serde(rename = "finish")]
    Finish { message_id: MessageId },
    #[serde(rename = "requeue")]
    Requeue {
        message_id: MessageId,
        #[serde(default)]
        delay_ms: u64,
    },
    #[serde(rename = "touch")]
    Touch { message_id: MessageId },
    #[serde(rename = "nop")]
    Nop,
    #[serde(rename = "close")]
    Close,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "identified")]
    Identified {
        version: u32,
        max_ready_count: u64,
        msg_timeout_ms: u64,
        heartbeat_interval_ms: u64,
    },
    #[serde(rename = "published")]
    Published { message_id: MessageId },
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "message")]
    Message {
        message_id: MessageId,
        attempts: u16,
        timestamp: i64,
        #[serde(with = "base64_payload")]
        payload: Vec<u8>,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "close_wait")]
    CloseWait,
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl From<&crate::broker::Message> for ServerMessage {
    fn from(msg: &crate::broker::Message) -> Self {
        ServerMessage::Message {
            message_id: msg.id,
            attempts: msg.attempts,
            timestamp: msg.timestamp,
            payload: msg.body.to_vec(),
        }
    }
}

mod base64_payload {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(text)
            .map_err(serde::de::Error::custom)
    }
}
