//! Per-channel bookkeeping for delivered-but-unacknowledged messages and for
//! messages parked by a delayed requeue.
//!
//! Both structures keep a deadline-ordered index so the sweeper only touches
//! entries that are actually due.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use crate::broker::id::MessageId;
use crate::broker::message::Message;
use crate::client::ClientId;
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub message: Message,
    pub client_id: ClientId,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
pub struct InFlightTracker {
    entries: HashMap<MessageId, InFlightEntry>,
    deadlines: BTreeSet<(Instant, MessageId)>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, message: Message, client_id: ClientId, deadline: Instant) {
        let id = message.id;
        if let Some(old) = self.entries.insert(
            id,
            InFlightEntry {
                message,
                client_id,
                deadline,
            },
        ) {
            self.deadlines.remove(&(old.deadline, id));
        }
        self.deadlines.insert((deadline, id));
    }

    /// Remove `id` if it is in flight for `client_id`.
    pub fn remove(&mut self, id: &MessageId, client_id: &str) -> Result<InFlightEntry> {
        match self.entries.get(id) {
            Some(entry) if entry.client_id == client_id => {}
            _ => return Err(BrokerError::NotInFlight(*id)),
        }
        let entry = self
            .entries
            .remove(id)
            .ok_or(BrokerError::NotInFlight(*id))?;
        self.deadlines.remove(&(entry.deadline, *id));
        Ok(entry)
    }

    /// Move the deadline of an in-flight message owned by `client_id`.
    pub fn touch(&mut self, id: &MessageId, client_id: &str, deadline: Instant) -> Result<()> {
        let entry = match self.entries.get_mut(id) {
            Some(entry) if entry.client_id == client_id => entry,
            _ => return Err(BrokerError::NotInFlight(*id)),
        };
        self.deadlines.remove(&(entry.deadline, *id));
        entry.deadline = deadline;
        self.deadlines.insert((deadline, *id));
        Ok(())
    }

    /// Remove every entry whose deadline is at or before `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<InFlightEntry> {
        let mut expired = Vec::new();
        while let Some(&(deadline, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_first();
            if let Some(entry) = self.entries.remove(&id) {
                expired.push(entry);
            }
        }
        expired
    }

    /// Remove every entry owned by `client_id`, earliest deadline first.
    pub fn drain_client(&mut self, client_id: &str) -> Vec<InFlightEntry> {
        let owned: Vec<(Instant, MessageId)> = self
            .deadlines
            .iter()
            .filter(|(_, id)| {
                self.entries
                    .get(id)
                    .is_some_and(|e| e.client_id == client_id)
            })
            .copied()
            .collect();

        owned
            .into_iter()
            .filter_map(|key| {
                self.deadlines.remove(&key);
                self.entries.remove(&key.1)
            })
            .collect()
    }

    /// Remove everything, earliest deadline first.
    pub fn drain(&mut self) -> Vec<InFlightEntry> {
        let deadlines = std::mem::take(&mut self.deadlines);
        deadlines
            .into_iter()
            .filter_map(|(_, id)| self.entries.remove(&id))
            .collect()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Messages waiting out a requeue delay, ordered by when they become ready.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    entries: BTreeMap<(Instant, MessageId), Message>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ready_at: Instant, message: Message) {
        self.entries.insert((ready_at, message.id), message);
    }

    /// Remove every message due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Message> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    pub fn drain(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
