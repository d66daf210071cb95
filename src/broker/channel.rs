//! Channel: one independent consumer group on a topic.
//!
//! A channel owns a two-tier ready queue, the in-flight tracker, the
//! deferred (delayed requeue) queue and the set of subscribed clients. Every
//! message copy lives in exactly one of {ready queue, in flight, deferred}
//! until it is finished or the channel is deleted.
//!
//! All state sits behind one mutex. The delivery loop (`pump`), client
//! commands and the timeout sweeper all take it, so they never race each
//! other. Delivery never blocks: clients receive over unbounded queues and
//! only while they hold credit.
//!
//! Connection selection is round-robin in subscription order, starting after
//! the client that was served last.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broker::id::MessageId;
use crate::broker::inflight::{DeferredQueue, InFlightEntry, InFlightTracker};
use crate::broker::message::Message;
use crate::broker::queue::BackedQueue;
use crate::client::Client;
use crate::config::BrokerSettings;
use crate::persistence::DiskQueue;
use crate::utils::{BrokerError, Result};

/// What one sweep pass moved back to the ready queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    pub timed_out: usize,
    pub promoted: usize,
}

impl std::ops::AddAssign for SweepOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.timed_out += rhs.timed_out;
        self.promoted += rhs.promoted;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub name: String,
    pub depth: u64,
    pub memory_depth: usize,
    pub backend_depth: u64,
    pub in_flight_count: usize,
    pub deferred_count: usize,
    pub message_count: u64,
    pub requeue_count: u64,
    pub timeout_count: u64,
    pub client_count: usize,
    pub healthy: bool,
}

#[derive(Debug)]
struct ChannelState {
    queue: BackedQueue,
    in_flight: InFlightTracker,
    deferred: DeferredQueue,
    clients: Vec<Client>,
    next_client: usize,
    closed: bool,
    healthy: bool,
    message_count: u64,
    requeue_count: u64,
    timeout_count: u64,
}

#[derive(Debug)]
pub struct Channel {
    topic: String,
    name: String,
    settings: Arc<BrokerSettings>,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub fn new(
        topic: &str,
        name: &str,
        settings: Arc<BrokerSettings>,
        overflow: DiskQueue,
    ) -> Self {
        let queue = BackedQueue::new(settings.mem_queue_size, overflow);
        Self {
            topic: topic.to_string(),
            name: name.to_string(),
            settings,
            state: Mutex::new(ChannelState {
                queue,
                in_flight: InFlightTracker::new(),
                deferred: DeferredQueue::new(),
                clients: Vec::new(),
                next_client: 0,
                closed: false,
                healthy: true,
                message_count: 0,
                requeue_count: 0,
                timeout_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic_name(&self) -> &str {
        &self.topic
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn msg_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.msg_timeout_ms)
    }

    fn closed_error(&self) -> BrokerError {
        BrokerError::Closed(format!("{}/{}", self.topic, self.name))
    }

    /// Enqueue a copy of a freshly published message. Only the owning topic
    /// calls this.
    pub fn put(&self, msg: Message) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.closed_error());
        }
        if let Err(e) = state.queue.put(msg) {
            state.healthy = false;
            error!(topic = %self.topic, channel = %self.name, "overflow write failed: {e}");
            return Err(e);
        }
        state.message_count += 1;
        state.pump(self.msg_timeout());
        Ok(())
    }

    /// Register a subscribed connection. It receives nothing until it
    /// grants credit with `set_ready`.
    pub fn add_client(&self, client: Client) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.closed_error());
        }
        info!(topic = %self.topic, channel = %self.name, client = %client.id, "client subscribed");
        state.clients.push(client);
        Ok(())
    }

    /// Unregister a connection and immediately requeue everything it held
    /// in flight. Returns how many messages were requeued.
    pub fn remove_client(&self, client_id: &str) -> usize {
        let mut state = self.lock();
        if let Some(pos) = state.clients.iter().position(|c| c.id == client_id) {
            state.clients.remove(pos);
            if pos < state.next_client {
                state.next_client -= 1;
            }
        }

        let owned = state.in_flight.drain_client(client_id);
        let requeued = owned.len();
        for entry in owned.into_iter().rev() {
            let msg = state.requeue_entry(entry);
            state.queue.put_front(msg);
        }
        if requeued > 0 {
            warn!(
                topic = %self.topic,
                channel = %self.name,
                client = client_id,
                requeued,
                "client left with messages in flight"
            );
        }
        state.pump(self.msg_timeout());
        requeued
    }

    /// Replace the credit a client has granted, then deliver what it allows.
    ///
    /// `count` bounds the client's unacknowledged messages, so whatever it
    /// already holds in flight is charged against the new grant.
    pub fn set_ready(&self, client_id: &str, count: u64) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.closed_error());
        }
        let client = state
            .client_mut(client_id)
            .ok_or_else(|| BrokerError::UnknownClient(client_id.to_string()))?;
        client.ready_count = count.saturating_sub(client.in_flight as u64);
        state.pump(self.msg_timeout());
        Ok(())
    }

    /// Acknowledge a message. Finishing something that is not in flight
    /// (for instance a second time) changes nothing and reports `NotInFlight`.
    pub fn finish(&self, client_id: &str, id: &MessageId) -> Result<()> {
        let mut state = self.lock();
        let entry = state.in_flight.remove(id, client_id)?;
        if let Some(client) = state.client_mut(&entry.client_id) {
            client.in_flight = client.in_flight.saturating_sub(1);
        }
        debug!(topic = %self.topic, channel = %self.name, id = %id, "finished");
        Ok(())
    }

    /// Return an in-flight message for redelivery: to the front of the ready
    /// queue when `delay` is zero, otherwise to the deferred queue.
    pub fn requeue(&self, client_id: &str, id: &MessageId, delay: Duration) -> Result<()> {
        let max = Duration::from_millis(self.settings.max_requeue_delay_ms);
        if delay > max {
            return Err(BrokerError::InvalidDelay {
                requested: delay,
                max,
            });
        }

        let mut state = self.lock();
        let entry = state.in_flight.remove(id, client_id)?;
        let msg = state.requeue_entry(entry);
        if delay.is_zero() {
            state.queue.put_front(msg);
            state.pump(self.msg_timeout());
        } else {
            state.deferred.push(Instant::now() + delay, msg);
        }
        Ok(())
    }

    /// Push an in-flight message's deadline out by a full timeout from now.
    pub fn touch(&self, client_id: &str, id: &MessageId) -> Result<()> {
        let mut state = self.lock();
        state
            .in_flight
            .touch(id, client_id, Instant::now() + self.msg_timeout())
    }

    /// Requeue every in-flight message whose deadline passed and release
    /// every deferred message that is due.
    pub fn sweep(&self, now: Instant) -> SweepOutcome {
        let mut state = self.lock();
        if state.closed {
            return SweepOutcome::default();
        }

        let expired = state.in_flight.pop_expired(now);
        let timed_out = expired.len();
        for entry in expired.into_iter().rev() {
            debug!(
                topic = %self.topic,
                channel = %self.name,
                id = %entry.message.id,
                client = %entry.client_id,
                "in-flight deadline elapsed"
            );
            state.timeout_count += 1;
            let msg = state.requeue_entry(entry);
            state.queue.put_front(msg);
        }

        let due = state.deferred.pop_due(now);
        let promoted = due.len();
        for msg in due.into_iter().rev() {
            state.queue.put_front(msg);
        }

        if timed_out + promoted > 0 {
            state.pump(self.msg_timeout());
        }
        SweepOutcome {
            timed_out,
            promoted,
        }
    }

    /// Shutdown path: stop delivering, disconnect clients, and move deferred,
    /// in-flight and memory-resident messages to the front of the overflow
    /// queue so a restart redelivers them.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.clients.clear();

        let deferred = state.deferred.drain();
        let in_flight = state.in_flight.drain();
        for msg in deferred.into_iter().rev() {
            state.queue.put_front(msg);
        }
        for entry in in_flight.into_iter().rev() {
            state.queue.put_front(entry.message);
        }
        info!(topic = %self.topic, channel = %self.name, depth = state.queue.depth(), "closing channel");
        state.queue.persist()
    }

    /// Deletion path: drop every queued, in-flight and deferred message and
    /// disconnect clients.
    pub fn delete(&self) -> Result<()> {
        let mut state = self.lock();
        state.closed = true;
        state.clients.clear();
        state.in_flight.drain();
        state.deferred.drain();
        info!(topic = %self.topic, channel = %self.name, "deleting channel");
        state.queue.clear()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn depth(&self) -> u64 {
        self.lock().queue.depth()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn deferred_count(&self) -> usize {
        self.lock().deferred.len()
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn stats(&self) -> ChannelStats {
        let state = self.lock();
        ChannelStats {
            name: self.name.clone(),
            depth: state.queue.depth(),
            memory_depth: state.queue.memory_depth(),
            backend_depth: state.queue.backend_depth(),
            in_flight_count: state.in_flight.len(),
            deferred_count: state.deferred.len(),
            message_count: state.message_count,
            requeue_count: state.requeue_count,
            timeout_count: state.timeout_count,
            client_count: state.clients.len(),
            healthy: state.healthy,
        }
    }
}

impl ChannelState {
    fn client_mut(&mut self, id: &str) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.id == id)
    }

    /// Round-robin pick of the next client holding credit.
    fn next_ready_client(&mut self) -> Option<usize> {
        let n = self.clients.len();
        for offset in 0..n {
            let idx = (self.next_client + offset) % n;
            if self.clients[idx].is_ready() {
                self.next_client = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    fn next_for_delivery(&mut self) -> Result<Option<Message>> {
        self.queue.pop()
    }

    /// Record `msg` as in flight to the client at `idx`, spend one unit of
    /// its credit, and hand it over. If the client's queue is gone the
    /// message stays in flight under it until disconnect or timeout
    /// requeues it.
    fn start_in_flight(&mut self, msg: Message, idx: usize, deadline: Instant) {
        let client = &mut self.clients[idx];
        client.ready_count -= 1;
        client.in_flight += 1;
        if client.sender.send(msg.clone()).is_err() {
            warn!(client = %client.id, "delivery queue closed, withdrawing credit");
            client.ready_count = 0;
        }
        let client_id = client.id.clone();
        self.in_flight.insert(msg, client_id, deadline);
    }

    fn requeue_entry(&mut self, mut entry: InFlightEntry) -> Message {
        if let Some(client) = self.client_mut(&entry.client_id) {
            client.in_flight = client.in_flight.saturating_sub(1);
        }
        entry.message.attempts = entry.message.attempts.saturating_add(1);
        self.requeue_count += 1;
        entry.message
    }

    /// Delivery loop: while some client has credit and a message is ready,
    /// move one message in flight to it.
    fn pump(&mut self, timeout: Duration) {
        if self.closed {
            return;
        }
        while let Some(idx) = self.next_ready_client() {
            let msg = match self.next_for_delivery() {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    // Nothing ready: give the pick back so round-robin stays fair.
                    self.next_client = idx;
                    break;
                }
                Err(e) => {
                    self.healthy = false;
                    error!("overflow read failed: {e}");
                    break;
                }
            };
            self.start_in_flight(msg, idx, Instant::now() + timeout);
        }
    }
}
