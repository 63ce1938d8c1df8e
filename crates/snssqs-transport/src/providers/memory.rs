//! In-memory broker implementation for testing and development.
//!
//! [`InMemoryBroker`] plays both sides of the transport:
//! - as a topic it records every publish and copies it onto each queue wired
//!   to the topic, either raw or wrapped in the topic's JSON envelope
//! - as a queue it supports long-poll receive, visibility timeouts and
//!   delete by receipt handle
//!
//! Clones share the same storage, so one broker can be handed to the
//! transport as both clients while a test inspects it.

use crate::client::{QueueClient, ReceiveRequest, TopicClient};
use crate::envelope::TopicEnvelope;
use crate::error::TransportError;
use crate::message::{
    Attributes, MessageId, PublishResponse, QueueUrl, ReceiptHandle, ReceivedMessage, TopicArn,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Behaviour of the in-memory broker
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Deliver topic publishes with attributes on the queue message instead
    /// of inside a JSON envelope
    pub raw_delivery: bool,

    /// How long a received message stays hidden before it is redelivered
    pub visibility_timeout: Duration,

    /// Publishes kept per topic for [`InMemoryBroker::published`]; older ones
    /// are dropped
    pub publish_history: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            raw_delivery: true,
            visibility_timeout: Duration::from_secs(30),
            publish_history: 1000,
        }
    }
}

/// A publish as recorded by the topic side of the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub message_id: MessageId,
    pub body: String,
    pub attributes: Attributes,
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: String,
    attributes: Attributes,
}

struct InFlightMessage {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Default)]
struct MemoryQueue {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlightMessage>,
}

impl MemoryQueue {
    /// Return messages whose visibility timeout has passed to the front of the queue
    fn release_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(entry) = self.in_flight.remove(&receipt) {
                debug!(
                    message_id = %entry.message.message_id,
                    "Visibility timeout expired, message is visible again"
                );
                self.ready.push_front(entry.message);
            }
        }
    }

    fn next_release(&self) -> Option<Instant> {
        self.in_flight.values().map(|m| m.visible_at).min()
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    subscriptions: HashMap<String, Vec<QueueUrl>>,
    published: HashMap<String, VecDeque<PublishedMessage>>,
    next_receipt: u64,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    arrivals: Notify,
    config: InMemoryConfig,
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory queue and topic
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                arrivals: Notify::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &InMemoryConfig {
        &self.inner.config
    }

    /// Create an empty queue; existing queues are left untouched
    pub fn create_queue(&self, queue: &QueueUrl) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.queues.entry(queue.as_str().to_string()).or_default();
        Ok(())
    }

    /// Deliver every future publish on `topic` to `queue`, creating the queue
    pub fn connect_topic(&self, topic: &TopicArn, queue: &QueueUrl) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.queues.entry(queue.as_str().to_string()).or_default();
        let queues = state
            .subscriptions
            .entry(topic.as_str().to_string())
            .or_default();
        if !queues.contains(queue) {
            queues.push(queue.clone());
        }
        Ok(())
    }

    /// Put a message straight onto a queue, bypassing the topic
    pub fn enqueue_raw(
        &self,
        queue: &QueueUrl,
        body: impl Into<String>,
        attributes: Attributes,
    ) -> Result<MessageId, TransportError> {
        let message_id = MessageId::new();
        {
            let mut state = self.lock()?;
            let target = state
                .queues
                .get_mut(queue.as_str())
                .ok_or_else(|| TransportError::QueueNotFound {
                    queue: queue.to_string(),
                })?;
            target.ready.push_back(StoredMessage {
                message_id: message_id.clone(),
                body: body.into(),
                attributes,
            });
        }
        self.inner.arrivals.notify_waiters();
        Ok(message_id)
    }

    /// Messages waiting to be received
    pub fn visible_count(&self, queue: &QueueUrl) -> Result<usize, TransportError> {
        let state = self.lock()?;
        Ok(state
            .queues
            .get(queue.as_str())
            .map(|q| q.ready.len())
            .unwrap_or(0))
    }

    /// Messages received but neither deleted nor returned to the queue yet
    pub fn in_flight_count(&self, queue: &QueueUrl) -> Result<usize, TransportError> {
        let state = self.lock()?;
        Ok(state
            .queues
            .get(queue.as_str())
            .map(|q| q.in_flight.len())
            .unwrap_or(0))
    }

    /// The most recent publishes accepted on `topic`, oldest first, up to
    /// `publish_history` of them
    pub fn published(&self, topic: &TopicArn) -> Result<Vec<PublishedMessage>, TransportError> {
        let state = self.lock()?;
        Ok(state
            .published
            .get(topic.as_str())
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        self.inner
            .state
            .lock()
            .map_err(|_| TransportError::ProviderError {
                provider: "InMemory".to_string(),
                code: "LockPoisoned".to_string(),
                message: "broker state lock poisoned".to_string(),
            })
    }

    /// Take up to `max` ready messages, marking them in flight.
    ///
    /// Returns the batch, or the instant the next in-flight message becomes
    /// visible again when nothing is ready.
    fn take_batch(
        &self,
        queue: &QueueUrl,
        max: usize,
    ) -> Result<(Vec<ReceivedMessage>, Option<Instant>), TransportError> {
        let mut guard = self.lock()?;
        let BrokerState {
            queues,
            next_receipt,
            ..
        } = &mut *guard;

        let target = queues
            .get_mut(queue.as_str())
            .ok_or_else(|| TransportError::QueueNotFound {
                queue: queue.to_string(),
            })?;

        let now = Instant::now();
        target.release_expired(now);

        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(message) = target.ready.pop_front() else {
                break;
            };

            *next_receipt += 1;
            let receipt = format!("{}#{}", message.message_id, next_receipt);
            batch.push(ReceivedMessage::new(
                message.message_id.clone(),
                message.body.clone(),
                message.attributes.clone(),
                ReceiptHandle::new(receipt.clone()),
            ));
            target.in_flight.insert(
                receipt,
                InFlightMessage {
                    message,
                    visible_at: now + self.inner.config.visibility_timeout,
                },
            );
        }

        Ok((batch, target.next_release()))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("config", &self.inner.config)
            .finish()
    }
}

#[async_trait]
impl QueueClient for InMemoryBroker {
    async fn receive_messages(
        &self,
        queue: &QueueUrl,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, TransportError> {
        let deadline = Instant::now() + request.wait_time;
        let max = request.max_messages.max(1) as usize;

        loop {
            // Register interest before looking so a publish in between still wakes us
            let arrival = self.inner.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let (batch, next_release) = self.take_batch(queue, max)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }

            let wake_at = next_release.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete_message(
        &self,
        queue: &QueueUrl,
        receipt: &ReceiptHandle,
    ) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let target = state
            .queues
            .get_mut(queue.as_str())
            .ok_or_else(|| TransportError::QueueNotFound {
                queue: queue.to_string(),
            })?;

        // Receipts of redelivered messages are superseded by the newer receipt
        match target.in_flight.remove(receipt.as_str()) {
            Some(_) => Ok(()),
            None => Err(TransportError::ReceiptInvalid {
                receipt: receipt.to_string(),
            }),
        }
    }
}

#[async_trait]
impl TopicClient for InMemoryBroker {
    async fn publish(
        &self,
        topic: &TopicArn,
        body: &str,
        attributes: &Attributes,
    ) -> Result<PublishResponse, TransportError> {
        let message_id = MessageId::new();

        let stored = if self.inner.config.raw_delivery {
            StoredMessage {
                message_id: message_id.clone(),
                body: body.to_string(),
                attributes: attributes.clone(),
            }
        } else {
            let envelope = TopicEnvelope::new(&message_id, topic, body, attributes)
                .to_json()
                .map_err(|e| TransportError::Decode {
                    message: format!("Failed to encode topic envelope: {}", e),
                })?;
            StoredMessage {
                message_id: message_id.clone(),
                body: envelope,
                attributes: Attributes::new(),
            }
        };

        {
            let mut guard = self.lock()?;
            let BrokerState {
                queues,
                subscriptions,
                published,
                ..
            } = &mut *guard;

            let history = published.entry(topic.as_str().to_string()).or_default();
            history.push_back(PublishedMessage {
                message_id: message_id.clone(),
                body: body.to_string(),
                attributes: attributes.clone(),
            });
            while history.len() > self.inner.config.publish_history {
                history.pop_front();
            }

            for queue in subscriptions.get(topic.as_str()).into_iter().flatten() {
                if let Some(target) = queues.get_mut(queue.as_str()) {
                    target.ready.push_back(stored.clone());
                }
            }
        }
        self.inner.arrivals.notify_waiters();

        Ok(PublishResponse {
            message_id,
            request_id: Some(uuid::Uuid::new_v4().to_string()),
        })
    }
}
