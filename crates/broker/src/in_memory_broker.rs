//! In-memory broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{AckHandle, Broker, BrokerError, Delivery};

/// Granularity at which a waiting consumer re-checks delayed messages and
/// expired leases.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Default lease length for in-flight messages.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(3600);

/// A message parked on a topic's dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub id: String,
    pub payload: Vec<u8>,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct Message {
    id: String,
    payload: Vec<u8>,
    delivered: bool,
}

#[derive(Debug, Default)]
struct TopicState {
    ready: VecDeque<Message>,
    delayed: Vec<(Instant, Message)>,
    in_flight: HashMap<String, (Instant, Message)>,
    dead: Vec<DeadLetter>,
}

impl TopicState {
    /// Move due delayed messages and expired leases back to `ready`.
    fn promote(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, msg) = self.delayed.swap_remove(i);
                self.ready.push_back(msg);
            } else {
                i += 1;
            }
        }

        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some((_, msg)) = self.in_flight.remove(&id) {
                self.ready.push_back(msg);
            }
        }
    }
}

/// In-process queue with leases, delayed delivery and a dead-letter list.
///
/// - At-least-once: unacked messages reappear once their lease expires
/// - Not durable: contents are lost with the process
#[derive(Debug)]
pub struct InMemoryBroker {
    topics: Mutex<HashMap<String, TopicState>>,
    notify: Notify,
    next_id: AtomicU64,
    visibility_timeout: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
            visibility_timeout,
        }
    }

    fn with_topic<R>(
        &self,
        topic: &str,
        f: impl FnOnce(&mut TopicState) -> R,
    ) -> Result<R, BrokerError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| BrokerError::Unavailable("in-memory broker lock poisoned".into()))?;
        Ok(f(topics.entry(topic.to_string()).or_default()))
    }

    fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Messages waiting for delivery, including delayed ones.
    pub fn pending_count(&self, topic: &str) -> usize {
        self.with_topic(topic, |t| t.ready.len() + t.delayed.len())
            .unwrap_or(0)
    }

    pub fn in_flight_count(&self, topic: &str) -> usize {
        self.with_topic(topic, |t| t.in_flight.len()).unwrap_or(0)
    }

    pub fn dead_letters(&self, topic: &str) -> Vec<DeadLetter> {
        self.with_topic(topic, |t| t.dead.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let id = self.next_id();
        self.with_topic(topic, |t| {
            t.ready.push_back(Message {
                id,
                payload,
                delivered: false,
            })
        })?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            let now = Instant::now();
            let lease = now + self.visibility_timeout;
            let taken = self.with_topic(topic, |t| {
                t.promote(now);
                let mut msg = t.ready.pop_front()?;
                let redelivered = msg.delivered;
                msg.delivered = true;
                let delivery = Delivery {
                    payload: msg.payload.clone(),
                    handle: AckHandle {
                        topic: topic.to_string(),
                        id: msg.id.clone(),
                    },
                    redelivered,
                };
                t.in_flight.insert(msg.id.clone(), (lease, msg));
                Some(delivery)
            })?;

            if taken.is_some() {
                return Ok(taken);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = (deadline - now).min(POLL_INTERVAL);
            let _ = tokio::time::timeout(nap, self.notify.notified()).await;
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), BrokerError> {
        self.with_topic(&handle.topic, |t| t.in_flight.remove(&handle.id))?
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownDelivery(handle.id.clone()))
    }

    async fn requeue(
        &self,
        handle: &AckHandle,
        payload: Vec<u8>,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let id = self.next_id();
        let ready_at = Instant::now() + delay;
        let found = self.with_topic(&handle.topic, |t| {
            let found = t.in_flight.remove(&handle.id).is_some();
            let msg = Message {
                id,
                payload,
                delivered: false,
            };
            if delay.is_zero() {
                t.ready.push_back(msg);
            } else {
                t.delayed.push((ready_at, msg));
            }
            found
        })?;
        self.notify.notify_waiters();

        if !found {
            // Replacement is scheduled regardless; the original lease had
            // already expired or been released.
            tracing::warn!(topic = %handle.topic, id = %handle.id, "requeue of stale delivery");
        }
        Ok(())
    }

    async fn dead_letter(&self, handle: &AckHandle, reason: &str) -> Result<(), BrokerError> {
        self.with_topic(&handle.topic, |t| {
            let (_, msg) = t.in_flight.remove(&handle.id)?;
            t.dead.push(DeadLetter {
                id: msg.id,
                payload: msg.payload,
                reason: reason.to_string(),
            });
            Some(())
        })?
        .ok_or_else(|| BrokerError::UnknownDelivery(handle.id.clone()))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
