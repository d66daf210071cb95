//! Error types shared by the broker engine and the persistence layer.
//!
//! Storage and resource failures surface to the nearest operation boundary
//! (a publish, an admin call). Connection loss and in-flight timeouts are not
//! errors at all: they are recovered by requeueing and never show up here.

use std::time::Duration;

use crate::broker::id::MessageId;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Overflow storage refused a write, so the publish could not be accepted.
    #[error("queue full: overflow storage for '{0}' rejected the write")]
    QueueFull(String),

    #[error("storage error: {0}")]
    Io(#[from] sled::Error),

    #[error("corrupt overflow record: {0}")]
    Corrupt(String),

    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    #[error("channel '{channel}' not found on topic '{topic}'")]
    ChannelNotFound { topic: String, channel: String },

    #[error("invalid name '{0}'")]
    InvalidName(String),

    #[error("message {0} is not in flight")]
    NotInFlight(MessageId),

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("requeue delay {requested:?} exceeds the maximum of {max:?}")]
    InvalidDelay { requested: Duration, max: Duration },

    #[error("'{0}' is closed")]
    Closed(String),

    #[error("client '{0}' is not subscribed")]
    UnknownClient(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
