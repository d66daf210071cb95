//! Topic management
//!
//! A `Topic` is the ingress point for one stream of published messages. It
//! owns an ingress queue and a set of channels, and every publish copies the
//! message into each channel that exists at that moment.
//!
//! The topic mutex is the single serialization point for publishes: enqueue
//! and fan-out happen under it, so every channel observes the same total
//! order. Lock order is always topic, then channel.
//!
//! While a topic has no channels, publishes accumulate in the ingress queue
//! (memory, then overflow) and the first channel created drains that backlog.
//! Channels created after that start empty.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{error, info};

use crate::broker::channel::{Channel, ChannelStats};
use crate::broker::id::MessageId;
use crate::broker::message::Message;
use crate::broker::queue::BackedQueue;
use crate::config::BrokerSettings;
use crate::persistence::Persistence;
use crate::utils::{BrokerError, Result};

const MAX_NAME_LEN: usize = 64;

/// Topic and channel names: 1 to 64 chars of `[A-Za-z0-9._-]`.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidName(name.to_string()))
    }
}

pub(crate) fn topic_queue_name(topic: &str) -> String {
    format!("topic:{topic}")
}

pub(crate) fn channel_queue_name(topic: &str, channel: &str) -> String {
    format!("channel:{topic}:{channel}")
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    pub name: String,
    pub depth: u64,
    pub memory_depth: usize,
    pub backend_depth: u64,
    pub message_count: u64,
    pub healthy: bool,
    pub channels: Vec<ChannelStats>,
}

#[derive(Debug)]
struct TopicState {
    queue: BackedQueue,
    channels: BTreeMap<String, Arc<Channel>>,
    closed: bool,
    healthy: bool,
    message_count: u64,
}

#[derive(Debug)]
pub struct Topic {
    name: String,
    settings: Arc<BrokerSettings>,
    persistence: Persistence,
    state: Mutex<TopicState>,
}

impl Topic {
    /// Create a topic, reopening its overflow queue if one was persisted.
    pub fn new(name: &str, settings: Arc<BrokerSettings>, persistence: Persistence) -> Result<Self> {
        validate_name(name)?;
        let overflow = persistence.open_queue(&topic_queue_name(name))?;
        let queue = BackedQueue::new(settings.mem_queue_size, overflow);
        Ok(Self {
            name: name.to_string(),
            settings,
            persistence,
            state: Mutex::new(TopicState {
                queue,
                channels: BTreeMap::new(),
                closed: false,
                healthy: true,
                message_count: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish a payload: assign an ID, enqueue once, copy into every
    /// channel. Memory pressure only moves messages to disk; the publish
    /// fails with `QueueFull` only when the overflow store rejects a write.
    pub fn put(&self, payload: Vec<u8>) -> Result<MessageId> {
        let max = self.settings.max_msg_size;
        if payload.len() > max {
            return Err(BrokerError::MessageTooLarge {
                size: payload.len(),
                max,
            });
        }

        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::Closed(self.name.clone()));
        }

        let msg = Message::new(payload);
        let id = msg.id;
        if let Err(e) = state.queue.put(msg) {
            state.healthy = false;
            error!(topic = %self.name, "ingress overflow write failed: {e}");
            return Err(BrokerError::QueueFull(self.name.clone()));
        }
        state.message_count += 1;

        if !state.channels.is_empty() {
            self.fan_out(&mut state)?;
        }
        Ok(id)
    }

    /// Drain the ingress queue into every channel, in order.
    fn fan_out(&self, state: &mut TopicState) -> Result<()> {
        let mut failed = false;
        loop {
            let msg = match state.queue.pop() {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    state.healthy = false;
                    error!(topic = %self.name, "ingress overflow read failed: {e}");
                    return Err(e);
                }
            };
            for channel in state.channels.values() {
                if let Err(e) = channel.put(msg.clone()) {
                    error!(topic = %self.name, channel = channel.name(), "fan-out failed: {e}");
                    failed = true;
                }
            }
        }
        if failed {
            return Err(BrokerError::QueueFull(self.name.clone()));
        }
        Ok(())
    }

    /// Return the named channel, creating it if needed. A new channel only
    /// sees messages published from now on, except for a backlog the topic
    /// held because it had no channels at all.
    pub fn get_channel(&self, name: &str) -> Result<Arc<Channel>> {
        validate_name(name)?;
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::Closed(self.name.clone()));
        }
        if let Some(channel) = state.channels.get(name) {
            return Ok(channel.clone());
        }

        let channel = self.create_channel(&mut state, name)?;
        if !state.queue.is_empty() {
            self.fan_out(&mut state)?;
        }
        Ok(channel)
    }

    /// Recreate persisted channels together, then hand them any topic backlog.
    pub(crate) fn restore_channels(&self, names: &[String]) -> Result<()> {
        let mut state = self.lock();
        for name in names {
            if validate_name(name).is_ok() && !state.channels.contains_key(name) {
                self.create_channel(&mut state, name)?;
            }
        }
        if !state.channels.is_empty() && !state.queue.is_empty() {
            self.fan_out(&mut state)?;
        }
        Ok(())
    }

    fn create_channel(&self, state: &mut TopicState, name: &str) -> Result<Arc<Channel>> {
        let overflow = self
            .persistence
            .open_queue(&channel_queue_name(&self.name, name))?;
        let channel = Arc::new(Channel::new(
            &self.name,
            name,
            self.settings.clone(),
            overflow,
        ));
        state.channels.insert(name.to_string(), channel.clone());
        info!(topic = %self.name, channel = name, "created channel");
        Ok(channel)
    }

    /// Look up a channel without creating it.
    pub fn channel(&self, name: &str) -> Result<Arc<Channel>> {
        self.lock()
            .channels
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::ChannelNotFound {
                topic: self.name.clone(),
                channel: name.to_string(),
            })
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.lock().channels.values().cloned().collect()
    }

    /// Remove a channel and discard everything it held, on disk included.
    /// The topic lock is held throughout, so a concurrent `get_channel` for
    /// the same name only runs once the old overflow tree is gone.
    pub fn delete_channel(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        let channel = state
            .channels
            .remove(name)
            .ok_or_else(|| BrokerError::ChannelNotFound {
                topic: self.name.clone(),
                channel: name.to_string(),
            })?;
        channel.delete()?;
        self.persistence
            .drop_queue(&channel_queue_name(&self.name, name))
    }

    /// Stop accepting publishes, persist the ingress queue and close every
    /// channel. Errors are logged per channel and the first one returned.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        info!(topic = %self.name, "closing topic");

        let mut first_err = state.queue.persist().err();
        for channel in state.channels.values() {
            if let Err(e) = channel.close() {
                error!(topic = %self.name, channel = channel.name(), "channel close failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close and discard the topic, its channels and all persisted data.
    pub fn delete(&self) -> Result<()> {
        let mut state = self.lock();
        state.closed = true;
        info!(topic = %self.name, "deleting topic");

        let channels = std::mem::take(&mut state.channels);
        for (name, channel) in channels {
            channel.delete()?;
            self.persistence
                .drop_queue(&channel_queue_name(&self.name, &name))?;
        }
        state.queue.clear()?;
        self.persistence.drop_queue(&topic_queue_name(&self.name))
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn depth(&self) -> u64 {
        self.lock().queue.depth()
    }

    pub fn stats(&self) -> TopicStats {
        let state = self.lock();
        TopicStats {
            name: self.name.clone(),
            depth: state.queue.depth(),
            memory_depth: state.queue.memory_depth(),
            backend_depth: state.queue.backend_depth(),
            message_count: state.message_count,
            healthy: state.healthy,
            channels: state.channels.values().map(|c| c.stats()).collect(),
        }
    }
}
