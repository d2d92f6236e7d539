//! In-process message bus with the delivery contract the pipeline is built on.
//!
//! Guarantees, per subscription:
//! - **At-least-once**: a delivered message is redelivered until it is acked,
//!   either immediately after a nack (subject to [`RetryPolicy`] backoff) or
//!   once its visibility lease expires.
//! - **Competing consumers**: each delivery is owned by exactly one consumer
//!   attached to the subscription until it is acked, nacked, or its lease
//!   expires. Nothing is broadcast within a subscription.
//! - **Flow control**: a consumer attachment never holds more than its
//!   configured number of outstanding deliveries.
//! - **Dead-lettering**: a message delivered `max_delivery_attempts` times
//!   without an ack moves to the subscription's dead-letter topic (or is
//!   dropped with an error log if none is configured).
//!
//! No ordering guarantees. [`MemoryBus`] is a cheap-to-clone handle over
//! shared state; `publish` returns only after the message is enqueued on
//! every subscription of the topic, which is the publish confirmation the
//! fan-out service waits on.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{error, warn};

pub mod retry;

pub use retry::RetryPolicy;

use crate::config::BusSection;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("topic already exists: {0}")]
    TopicExists(String),
    #[error("subscription already exists: {0}")]
    SubscriptionExists(String),
    #[error("no such topic: {0}")]
    NoSuchTopic(String),
    #[error("no such subscription: {0}")]
    NoSuchSubscription(String),
}

/// Identifier assigned to a message at publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Delivery parameters of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub dead_letter_topic: Option<String>,
    pub max_delivery_attempts: u32,
    pub retry: RetryPolicy,
    pub visibility_timeout: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            dead_letter_topic: None,
            max_delivery_attempts: 5,
            retry: RetryPolicy::default(),
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

/// Cooperative shutdown flag shared between the runner and worker loops.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    tx: watch::Sender<bool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

struct QueuedMessage {
    id: MessageId,
    payload: Arc<Vec<u8>>,
    /// Times this message has already been delivered on this subscription.
    attempt: u32,
    ready_at: Instant,
}

struct LeasedMessage {
    id: MessageId,
    payload: Arc<Vec<u8>>,
    attempt: u32,
    deadline: Instant,
    lease: u64,
}

struct SubState {
    config: SubscriptionConfig,
    queue: Vec<QueuedMessage>,
    inflight: HashMap<u64, LeasedMessage>,
    notify: Arc<Notify>,
}

struct BusState {
    topics: HashMap<String, Vec<String>>,
    subscriptions: HashMap<String, SubState>,
    next_message_id: u64,
    next_lease: u64,
}

enum LeaseOutcome {
    Delivered {
        message_id: MessageId,
        payload: Vec<u8>,
        attempt: u32,
        lease: u64,
    },
    Empty {
        next_wake: Option<Instant>,
    },
}

impl BusState {
    fn fan_out(&mut self, topic: &str, id: MessageId, payload: &Arc<Vec<u8>>, now: Instant) {
        let subs = match self.topics.get(topic) {
            Some(names) => names.clone(),
            None => return,
        };
        for name in subs {
            if let Some(sub) = self.subscriptions.get_mut(&name) {
                sub.queue.push(QueuedMessage {
                    id,
                    payload: payload.clone(),
                    attempt: 0,
                    ready_at: now,
                });
                sub.notify.notify_one();
            }
        }
    }

    fn try_lease(&mut self, name: &str, now: Instant) -> Result<LeaseOutcome, BusError> {
        // (dead-letter topic, message) pairs to move once the sub borrow ends.
        let mut exhausted: Vec<(Option<String>, MessageId, Arc<Vec<u8>>)> = Vec::new();
        let outcome = {
            let sub = self
                .subscriptions
                .get_mut(name)
                .ok_or_else(|| BusError::NoSuchSubscription(name.to_string()))?;

            // Reclaim expired leases; their delivery already counted.
            let expired: Vec<u64> = sub
                .inflight
                .iter()
                .filter(|(_, l)| l.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                if let Some(l) = sub.inflight.remove(&id) {
                    sub.queue.push(QueuedMessage {
                        id: l.id,
                        payload: l.payload,
                        attempt: l.attempt,
                        ready_at: now,
                    });
                }
            }

            loop {
                match sub.queue.iter().position(|m| m.ready_at <= now) {
                    Some(i) if sub.queue[i].attempt >= sub.config.max_delivery_attempts => {
                        let m = sub.queue.swap_remove(i);
                        exhausted.push((sub.config.dead_letter_topic.clone(), m.id, m.payload));
                    }
                    Some(i) => {
                        let mut m = sub.queue.swap_remove(i);
                        m.attempt += 1;
                        self.next_lease += 1;
                        let lease = self.next_lease;
                        let payload = (*m.payload).clone();
                        sub.inflight.insert(
                            m.id.0,
                            LeasedMessage {
                                id: m.id,
                                payload: m.payload,
                                attempt: m.attempt,
                                deadline: now + sub.config.visibility_timeout,
                                lease,
                            },
                        );
                        break LeaseOutcome::Delivered {
                            message_id: m.id,
                            payload,
                            attempt: m.attempt,
                            lease,
                        };
                    }
                    None => {
                        let next_ready = sub.queue.iter().map(|m| m.ready_at).min();
                        let next_expiry = sub.inflight.values().map(|l| l.deadline).min();
                        let next_wake = match (next_ready, next_expiry) {
                            (Some(a), Some(b)) => Some(a.min(b)),
                            (a, b) => a.or(b),
                        };
                        break LeaseOutcome::Empty { next_wake };
                    }
                }
            }
        };
        for (dlq, id, payload) in exhausted {
            match dlq {
                Some(topic) if self.topics.contains_key(&topic) => {
                    error!(message_id = %id, subscription = name, dead_letter = %topic,
                        "delivery attempts exhausted; dead-lettering");
                    self.fan_out(&topic, id, &payload, now);
                }
                Some(topic) => {
                    error!(message_id = %id, subscription = name, dead_letter = %topic,
                        "dead-letter topic missing; dropping message");
                }
                None => {
                    error!(message_id = %id, subscription = name,
                        "delivery attempts exhausted with no dead-letter topic; dropping message");
                }
            }
        }
        Ok(outcome)
    }

    fn ack(&mut self, name: &str, message_id: MessageId, lease: u64) {
        if let Some(sub) = self.subscriptions.get_mut(name) {
            let matches = sub
                .inflight
                .get(&message_id.0)
                .map(|l| l.lease == lease)
                .unwrap_or(false);
            if matches {
                sub.inflight.remove(&message_id.0);
            }
            // A mismatch means the lease expired and the message moved on;
            // the late ack is a no-op.
        }
    }

    fn nack(&mut self, name: &str, message_id: MessageId, lease: u64, now: Instant) {
        if let Some(sub) = self.subscriptions.get_mut(name) {
            let matches = sub
                .inflight
                .get(&message_id.0)
                .map(|l| l.lease == lease)
                .unwrap_or(false);
            if matches {
                if let Some(l) = sub.inflight.remove(&message_id.0) {
                    let delay = sub.config.retry.delay(l.attempt);
                    sub.queue.push(QueuedMessage {
                        id: l.id,
                        payload: l.payload,
                        attempt: l.attempt,
                        ready_at: now + delay,
                    });
                    sub.notify.notify_one();
                }
            }
        }
    }
}

/// Handle to the shared bus. Clone freely; all clones see the same topics.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                topics: HashMap::new(),
                subscriptions: HashMap::new(),
                next_message_id: 0,
                next_lease: 0,
            })),
        }
    }

    pub async fn create_topic(&self, name: &str) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if state.topics.contains_key(name) {
            return Err(BusError::TopicExists(name.to_string()));
        }
        state.topics.insert(name.to_string(), Vec::new());
        Ok(())
    }

    pub async fn create_subscription(
        &self,
        topic: &str,
        name: &str,
        config: SubscriptionConfig,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if !state.topics.contains_key(topic) {
            return Err(BusError::NoSuchTopic(topic.to_string()));
        }
        if state.subscriptions.contains_key(name) {
            return Err(BusError::SubscriptionExists(name.to_string()));
        }
        state.subscriptions.insert(
            name.to_string(),
            SubState {
                config,
                queue: Vec::new(),
                inflight: HashMap::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        if let Some(subs) = state.topics.get_mut(topic) {
            subs.push(name.to_string());
        }
        Ok(())
    }

    /// Durably accept `payload` on `topic`. Returns once the message is
    /// enqueued on every subscription of the topic; a topic with no
    /// subscriptions accepts and discards.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<MessageId, BusError> {
        let mut state = self.state.lock().await;
        if !state.topics.contains_key(topic) {
            return Err(BusError::NoSuchTopic(topic.to_string()));
        }
        state.next_message_id += 1;
        let id = MessageId(state.next_message_id);
        let payload = Arc::new(payload);
        state.fan_out(topic, id, &payload, Instant::now());
        Ok(id)
    }

    /// Attach a consumer to `subscription` with at most `max_in_flight`
    /// outstanding (unacknowledged) deliveries.
    pub async fn consumer(
        &self,
        subscription: &str,
        max_in_flight: usize,
    ) -> Result<Consumer, BusError> {
        let state = self.state.lock().await;
        let sub = state
            .subscriptions
            .get(subscription)
            .ok_or_else(|| BusError::NoSuchSubscription(subscription.to_string()))?;
        Ok(Consumer {
            bus: self.clone(),
            subscription: subscription.to_string(),
            notify: sub.notify.clone(),
            limit: Arc::new(Semaphore::new(max_in_flight.max(1))),
        })
    }

    /// Backlog plus in-flight count for a subscription. Zero means quiescent.
    pub async fn depth(&self, subscription: &str) -> Result<usize, BusError> {
        let state = self.state.lock().await;
        let sub = state
            .subscriptions
            .get(subscription)
            .ok_or_else(|| BusError::NoSuchSubscription(subscription.to_string()))?;
        Ok(sub.queue.len() + sub.inflight.len())
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBus").finish_non_exhaustive()
    }
}

/// One message handed to a consumer. Resolve it through `acker`; dropping the
/// acker unresolved leaves the message leased until the visibility timeout.
pub struct Delivery {
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    /// 1-based count of deliveries of this message on this subscription.
    pub attempt: u32,
    pub acker: Acker,
}

/// A consumer attachment. Competing consumers are created by attaching
/// several `Consumer`s to the same subscription.
pub struct Consumer {
    bus: MemoryBus,
    subscription: String,
    notify: Arc<Notify>,
    limit: Arc<Semaphore>,
}

impl Consumer {
    /// Receive the next available message, waiting if none is ready.
    /// Returns `None` once `cancel` fires (in-flight deliveries handed out
    /// earlier remain valid and should still be acked or nacked).
    pub async fn recv(&self, cancel: &CancelFlag) -> Option<Delivery> {
        let permit = tokio::select! {
            permit = self.limit.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return None,
            },
            _ = cancel.cancelled() => return None,
        };
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let outcome = {
                let mut state = self.bus.state.lock().await;
                state.try_lease(&self.subscription, Instant::now())
            };
            let outcome = match outcome {
                Ok(o) => o,
                Err(err) => {
                    error!(?err, subscription = %self.subscription, "receive failed");
                    return None;
                }
            };
            match outcome {
                LeaseOutcome::Delivered {
                    message_id,
                    payload,
                    attempt,
                    lease,
                } => {
                    return Some(Delivery {
                        message_id,
                        payload,
                        attempt,
                        acker: Acker {
                            bus: self.bus.clone(),
                            subscription: self.subscription.clone(),
                            message_id,
                            lease,
                            notify: self.notify.clone(),
                            resolved: false,
                            _permit: permit,
                        },
                    });
                }
                LeaseOutcome::Empty { next_wake } => match next_wake {
                    Some(at) => tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                        _ = cancel.cancelled() => return None,
                    },
                    None => tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = cancel.cancelled() => return None,
                    },
                },
            }
        }
    }
}

/// Resolves one delivery. Holds the consumer's flow-control permit until
/// dropped.
pub struct Acker {
    bus: MemoryBus,
    subscription: String,
    message_id: MessageId,
    lease: u64,
    notify: Arc<Notify>,
    resolved: bool,
    _permit: OwnedSemaphorePermit,
}

impl Acker {
    /// Mark the message permanently consumed on this subscription. A stale
    /// ack (lease already expired) is a no-op.
    pub async fn ack(mut self) {
        self.resolved = true;
        let mut state = self.bus.state.lock().await;
        state.ack(&self.subscription, self.message_id, self.lease);
    }

    /// Make the message eligible for redelivery after the retry backoff.
    pub async fn nack(mut self) {
        self.resolved = true;
        warn!(message_id = %self.message_id, subscription = %self.subscription,
            "message nacked; scheduling redelivery");
        let mut state = self.bus.state.lock().await;
        state.nack(&self.subscription, self.message_id, self.lease, Instant::now());
    }
}

impl Drop for Acker {
    fn drop(&mut self) {
        if !self.resolved {
            // The lease expires on its own; wake waiters so one of them
            // starts tracking the expiry deadline.
            self.notify.notify_waiters();
        }
    }
}

/// Create the pipeline's topics and subscriptions on `bus`.
///
/// The dispatch subscription gets the dead-letter policy; the fan-out
/// subscription deliberately has none (a poison publish event is dropped at
/// the ceiling rather than parked), and the dead-letter subscription exists
/// for operator inspection.
pub async fn provision_topology(bus: &MemoryBus, cfg: &BusSection) -> Result<(), BusError> {
    bus.create_topic(&cfg.content_topic).await?;
    bus.create_topic(&cfg.batch_topic).await?;
    bus.create_topic(&cfg.dead_letter_topic).await?;

    bus.create_subscription(
        &cfg.content_topic,
        &cfg.fanout_subscription,
        SubscriptionConfig {
            dead_letter_topic: None,
            max_delivery_attempts: cfg.max_delivery_attempts,
            retry: cfg.retry_policy(),
            visibility_timeout: cfg.visibility_timeout(),
        },
    )
    .await?;
    bus.create_subscription(
        &cfg.batch_topic,
        &cfg.dispatch_subscription,
        SubscriptionConfig {
            dead_letter_topic: Some(cfg.dead_letter_topic.clone()),
            max_delivery_attempts: cfg.max_delivery_attempts,
            retry: cfg.retry_policy(),
            visibility_timeout: cfg.visibility_timeout(),
        },
    )
    .await?;
    bus.create_subscription(
        &cfg.dead_letter_topic,
        &cfg.dead_letter_subscription,
        SubscriptionConfig {
            dead_letter_topic: None,
            max_delivery_attempts: cfg.max_delivery_attempts,
            retry: cfg.retry_policy(),
            visibility_timeout: cfg.visibility_timeout(),
        },
    )
    .await?;
    Ok(())
}
