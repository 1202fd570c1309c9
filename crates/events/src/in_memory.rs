//! In-memory broker for tests/dev.
//!
//! - One append-only log per topic
//! - Per (topic, group) commit tracking, so unacknowledged messages are redelivered
//!   after `restart_group` (crash simulation)
//! - Duplicate `event_id`s are dropped on publish (idempotent producer)
//! - Scripted publish failures for exercising retry paths

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::envelope::EventEnvelope;
use crate::publisher::{EventPublisher, PublishError};
use crate::source::{Delivery, MessageSource, SourceError};

/// A message as stored in a topic log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// A message parked by a consumer after repeated failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub topic: String,
    pub group: String,
    pub offset: usize,
    pub payload: Vec<u8>,
    pub reason: String,
}

#[derive(Debug, Default)]
struct TopicLog {
    entries: Vec<StoredMessage>,
    seen_event_ids: HashSet<String>,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Next never-delivered offset.
    next: usize,
    acked: BTreeSet<usize>,
    /// Delivered, not acked, handed back for redelivery.
    released: BTreeSet<usize>,
    attempts: HashMap<usize, u32>,
}

impl GroupState {
    /// Lowest offset that has not been acknowledged.
    fn committed(&self) -> usize {
        let mut offset = 0;
        while self.acked.contains(&offset) {
            offset += 1;
        }
        offset
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    groups: HashMap<(String, String), GroupState>,
    dead_letters: Vec<DeadLetter>,
    scripted_failures: VecDeque<PublishError>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock cannot leave the log half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `publish` calls fail with the given errors, in order.
    pub fn fail_next_publishes(&self, errors: impl IntoIterator<Item = PublishError>) {
        self.lock().scripted_failures.extend(errors);
    }

    /// Append raw bytes, bypassing envelope metadata (e.g. a malformed message).
    pub fn push_raw(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .entries
            .push(StoredMessage {
                event_id: None,
                event_type: None,
                key: None,
                payload: payload.into(),
            });
        self.notify.notify_waiters();
    }

    pub fn messages(&self, topic: &str) -> Vec<StoredMessage> {
        self.lock()
            .topics
            .get(topic)
            .map(|t| t.entries.clone())
            .unwrap_or_default()
    }

    /// Lowest offset the group has not acknowledged yet.
    pub fn committed_offset(&self, topic: &str, group: &str) -> usize {
        self.lock()
            .groups
            .get(&(topic.to_string(), group.to_string()))
            .map(GroupState::committed)
            .unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    /// Simulate a consumer crash: every delivered-but-unacked message of the
    /// group becomes eligible for redelivery.
    pub fn restart_group(&self, topic: &str, group: &str) {
        let mut state = self.lock();
        if let Some(g) = state.groups.get_mut(&(topic.to_string(), group.to_string())) {
            g.next = g.committed();
            g.released.clear();
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Consumer for `topic` within consumer group `group`.
    pub fn source(self: &Arc<Self>, topic: &str, group: &str) -> InMemorySource {
        self.lock()
            .groups
            .entry((topic.to_string(), group.to_string()))
            .or_default();

        InMemorySource {
            broker: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn publish(&self, topic: &str, event: &EventEnvelope) -> Result<(), PublishError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PublishError::Closed);
        }
        if let Some(err) = state.scripted_failures.pop_front() {
            return Err(err);
        }

        let log = state.topics.entry(topic.to_string()).or_default();
        if !log.seen_event_ids.insert(event.event_id().to_string()) {
            return Ok(());
        }
        log.entries.push(StoredMessage {
            event_id: Some(event.event_id().to_string()),
            event_type: Some(event.event_type().to_string()),
            key: Some(event.key().to_string()),
            payload: event.payload().to_vec(),
        });
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.lock().closed = true;
        Ok(())
    }
}

/// One consumer of an `InMemoryBroker` topic.
#[derive(Debug)]
pub struct InMemorySource {
    broker: Arc<InMemoryBroker>,
    topic: String,
    group: String,
    poll_interval: Duration,
}

impl InMemorySource {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn try_take(&self) -> Option<Delivery> {
        let mut state = self.broker.lock();
        let len = state.topics.get(&self.topic).map(|t| t.entries.len()).unwrap_or(0);
        let group = state
            .groups
            .entry((self.topic.clone(), self.group.clone()))
            .or_default();

        let offset = if let Some(first) = group.released.pop_first() {
            first
        } else {
            while group.next < len && group.acked.contains(&group.next) {
                group.next += 1;
            }
            if group.next >= len {
                return None;
            }
            group.next += 1;
            group.next - 1
        };

        let attempts = group.attempts.entry(offset).or_insert(0);
        *attempts += 1;
        let attempt = *attempts;

        let payload = state.topics.get(&self.topic)?.entries.get(offset)?.payload.clone();

        Some(Delivery {
            id: offset.to_string(),
            topic: self.topic.clone(),
            payload,
            attempt,
        })
    }

    fn offset_of(delivery: &Delivery) -> Result<usize, SourceError> {
        delivery
            .id
            .parse::<usize>()
            .map_err(|e| SourceError::Fatal(format!("invalid delivery id {}: {e}", delivery.id)))
    }

    fn with_group<T>(&self, f: impl FnOnce(&mut GroupState) -> T) -> T {
        let mut state = self.broker.lock();
        let group = state
            .groups
            .entry((self.topic.clone(), self.group.clone()))
            .or_default();
        f(group)
    }
}

#[async_trait]
impl MessageSource for InMemorySource {
    async fn next(&mut self) -> Result<Option<Delivery>, SourceError> {
        let notified = self.broker.notify.notified();
        if let Some(delivery) = self.try_take() {
            return Ok(Some(delivery));
        }
        if tokio::time::timeout(self.poll_interval, notified).await.is_err() {
            return Ok(None);
        }
        Ok(self.try_take())
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), SourceError> {
        let offset = Self::offset_of(delivery)?;
        self.with_group(|g| {
            g.acked.insert(offset);
            g.released.remove(&offset);
        });
        Ok(())
    }

    async fn release(&mut self, delivery: &Delivery) -> Result<(), SourceError> {
        let offset = Self::offset_of(delivery)?;
        self.with_group(|g| {
            if !g.acked.contains(&offset) {
                g.released.insert(offset);
            }
        });
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), SourceError> {
        let offset = Self::offset_of(delivery)?;
        {
            let mut state = self.broker.lock();
            state.dead_letters.push(DeadLetter {
                topic: self.topic.clone(),
                group: self.group.clone(),
                offset,
                payload: delivery.payload.clone(),
                reason: reason.to_string(),
            });
        }
        self.ack(delivery).await
    }
}
