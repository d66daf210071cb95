//! Broker engine
//!
//! `Broker` is the process-wide registry from topic name to `Topic`. It
//! starts empty (apart from topics recovered from the overflow store),
//! creates topics on first reference, and closes and clears them on
//! shutdown.
//!
//! Concurrency and usage notes:
//! - The topic map sits behind one mutex, which is the single point where
//!   get-or-create happens, so two callers can never create the same topic.
//!   The lock is released before any publish or channel work.
//! - The sweep loop is meant to run as a background task; each tick it
//!   requeues expired in-flight messages and releases due deferred ones on
//!   every channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::broker::channel::{Channel, SweepOutcome};
use crate::broker::id::MessageId;
use crate::broker::topic::{Topic, TopicStats};
use crate::config::BrokerSettings;
use crate::lookup::Registration;
use crate::persistence::Persistence;
use crate::utils::{BrokerError, Result};

#[derive(Debug)]
pub struct Broker {
    settings: Arc<BrokerSettings>,
    persistence: Persistence,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    closed: AtomicBool,
}

impl Broker {
    /// Open the overflow store named by `settings.data_path` (a temporary
    /// one when unset) and recover every topic and channel found in it.
    /// Failing here is the only fatal storage error.
    pub fn open(settings: BrokerSettings) -> Result<Self> {
        let persistence = match settings.data_path.as_deref() {
            Some(path) => Persistence::open(path)?,
            None => Persistence::temporary()?,
        };
        let broker = Self::new_with_persistence(settings, persistence);
        broker.restore()?;
        Ok(broker)
    }

    pub fn new_with_persistence(settings: BrokerSettings, persistence: Persistence) -> Self {
        Self {
            settings: Arc::new(settings),
            persistence,
            topics: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn restore(&self) -> Result<()> {
        let mut found: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in self.persistence.queue_names() {
            if let Some(topic) = name.strip_prefix("topic:") {
                found.entry(topic.to_string()).or_default();
            } else if let Some(rest) = name.strip_prefix("channel:") {
                if let Some((topic, channel)) = rest.split_once(':') {
                    found
                        .entry(topic.to_string())
                        .or_default()
                        .push(channel.to_string());
                }
            }
        }

        for (topic_name, channels) in found {
            let topic = match self.get_topic(&topic_name) {
                Ok(topic) => topic,
                Err(e) => {
                    error!(topic = %topic_name, "skipping persisted topic: {e}");
                    continue;
                }
            };
            topic.restore_channels(&channels)?;
            info!(topic = %topic_name, channels = channels.len(), depth = topic.depth(), "restored topic");
        }
        Ok(())
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    fn lock_topics(&self) -> MutexGuard<'_, HashMap<String, Arc<Topic>>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the named topic, creating it on first reference.
    pub fn get_topic(&self, name: &str) -> Result<Arc<Topic>> {
        let mut topics = self.lock_topics();
        // Checked under the map lock: `close` flips the flag while holding it.
        if self.is_closed() {
            return Err(BrokerError::Closed("broker".to_string()));
        }
        if let Some(topic) = topics.get(name) {
            return Ok(topic.clone());
        }
        let topic = Arc::new(Topic::new(
            name,
            self.settings.clone(),
            self.persistence.clone(),
        )?);
        topics.insert(name.to_string(), topic.clone());
        info!(topic = name, "created topic");
        Ok(topic)
    }

    /// Look up a topic without creating it.
    pub fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        self.lock_topics()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))
    }

    /// All topics, ordered by name.
    pub fn topics(&self) -> Vec<Arc<Topic>> {
        let mut topics: Vec<_> = self.lock_topics().values().cloned().collect();
        topics.sort_by(|a, b| a.name().cmp(b.name()));
        topics
    }

    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<MessageId> {
        self.get_topic(topic)?.put(payload)
    }

    /// Get-or-create both the topic and the channel.
    pub fn get_channel(&self, topic: &str, channel: &str) -> Result<Arc<Channel>> {
        self.get_topic(topic)?.get_channel(channel)
    }

    /// Delete a topic with its channels and persisted data. The map lock is
    /// held until the trees are dropped, so the name cannot be recreated
    /// on top of a tree that is about to disappear.
    pub fn delete_topic(&self, name: &str) -> Result<()> {
        let mut topics = self.lock_topics();
        let topic = topics
            .remove(name)
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))?;
        topic.delete()
    }

    pub fn delete_channel(&self, topic: &str, channel: &str) -> Result<()> {
        self.topic(topic)?.delete_channel(channel)
    }

    /// Read-only stats for the admin collaborator.
    pub fn stats(&self) -> Vec<TopicStats> {
        self.topics().iter().map(|t| t.stats()).collect()
    }

    /// Snapshot of every topic and channel for discovery announcements. A
    /// topic without channels is listed with `channel: None`.
    pub fn registrations(&self) -> Vec<Registration> {
        let mut regs = Vec::new();
        for topic in self.topics() {
            regs.push(Registration {
                topic: topic.name().to_string(),
                channel: None,
            });
            for channel in topic.channels() {
                regs.push(Registration {
                    topic: topic.name().to_string(),
                    channel: Some(channel.name().to_string()),
                });
            }
        }
        regs
    }

    /// One sweep pass over every channel of every topic.
    pub fn sweep(&self, now: Instant) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        for topic in self.topics() {
            for channel in topic.channels() {
                outcome += channel.sweep(now);
            }
        }
        outcome
    }

    /// Drive `sweep` every `sweep_interval_ms` until the broker closes.
    pub async fn start_sweep_loop(broker: Arc<Broker>) {
        let period = Duration::from_millis(broker.settings.sweep_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if broker.is_closed() {
                debug!("sweep loop stopping");
                break;
            }
            let outcome = broker.sweep(Instant::now());
            if outcome.timed_out > 0 || outcome.promoted > 0 {
                debug!(
                    timed_out = outcome.timed_out,
                    promoted = outcome.promoted,
                    "sweep requeued messages"
                );
            }
        }
    }

    /// Shut down: refuse further publishes, persist and close every topic,
    /// then flush the store. Idempotent.
    pub fn close(&self) -> Result<()> {
        let topics: Vec<_> = {
            let mut map = self.lock_topics();
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            map.drain().map(|(_, t)| t).collect()
        };
        info!("closing broker");

        let mut first_err = None;
        for topic in topics {
            if let Err(e) = topic.close() {
                error!(topic = topic.name(), "topic close failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.persistence.flush() {
            error!("final flush failed: {e}");
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
