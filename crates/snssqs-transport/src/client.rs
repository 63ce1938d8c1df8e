//! Client traits for the queue and topic brokers.
//!
//! The transport only needs three broker calls: receive a batch from the queue,
//! delete a received message, and publish to the topic. Implementations must be
//! safe to share across tasks; the transport holds them behind `Arc`.

use crate::error::TransportError;
use crate::message::{
    Attributes, PublishResponse, QueueUrl, ReceiptHandle, ReceivedMessage, TopicArn,
    PIPE_ATTRIBUTE,
};
use async_trait::async_trait;
use std::time::Duration;

/// Largest batch a single receive may return
pub const MAX_RECEIVE_BATCH: u32 = 10;

/// Longest long-poll wait a single receive may use
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

/// Parameters of a single queue receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Maximum number of messages to return (1-10)
    pub max_messages: u32,

    /// Long-poll wait when the queue is empty (0-20s)
    pub wait_time: Duration,

    /// Message attributes to return with each message
    pub attribute_names: Vec<String>,
}

impl ReceiveRequest {
    /// Receive requesting only the `pipe` attribute; limits are clamped to the
    /// broker's bounds
    pub fn new(max_messages: u32, wait_time: Duration) -> Self {
        Self {
            max_messages: max_messages.clamp(1, MAX_RECEIVE_BATCH),
            wait_time: wait_time.min(MAX_WAIT_TIME),
            attribute_names: vec![PIPE_ATTRIBUTE.to_string()],
        }
    }
}

/// Point-to-point queue operations
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `request.max_messages` messages, waiting at most
    /// `request.wait_time` for the first one
    async fn receive_messages(
        &self,
        queue: &QueueUrl,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, TransportError>;

    /// Remove a received message using its receipt handle
    async fn delete_message(
        &self,
        queue: &QueueUrl,
        receipt: &ReceiptHandle,
    ) -> Result<(), TransportError>;
}

/// Fan-out topic operations
#[async_trait]
pub trait TopicClient: Send + Sync {
    /// Publish `body` with string-typed `attributes`
    async fn publish(
        &self,
        topic: &TopicArn,
        body: &str,
        attributes: &Attributes,
    ) -> Result<PublishResponse, TransportError>;
}
