//! Topic publishing with fixed-delay retry.

use crate::client::TopicClient;
use crate::error::TransportError;
use crate::message::{OutboundMessage, PublishResponse, TopicArn};
use crate::metrics::{stats, Metrics};
use crate::retry::RetryPolicy;
use std::sync::Arc;
use tracing::{debug, error};

#[cfg(test)]
#[path = "publisher_tests.rs"]
mod tests;

/// Publishes outbound messages to the transport's topic
#[derive(Clone)]
pub struct Publisher {
    client: Arc<dyn TopicClient>,
    topic: TopicArn,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl Publisher {
    pub fn new(
        client: Arc<dyn TopicClient>,
        topic: TopicArn,
        retry: RetryPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            client,
            topic,
            retry,
            metrics,
        }
    }

    pub fn topic(&self) -> &TopicArn {
        &self.topic
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Publish `message` with its `type`/`pipe` tags and caller attributes.
    ///
    /// Invalid messages are rejected before any broker call. Broker errors are
    /// retried per the retry policy; the published counter is only bumped on
    /// success.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Validation`] when the classification or pipe is empty
    /// - [`TransportError::PublishExhausted`] carrying the last broker error
    pub async fn publish(
        &self,
        message: &OutboundMessage,
    ) -> Result<PublishResponse, TransportError> {
        message.validate()?;
        let attributes = message.message_attributes();

        let response = self
            .retry
            .run("publish", || {
                self.client.publish(&self.topic, &message.body, &attributes)
            })
            .await
            .map_err(|failure| {
                error!(
                    topic = %self.topic,
                    pipe = %message.pipe,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "Publish failed, giving up"
                );
                TransportError::PublishExhausted {
                    attempts: failure.attempts,
                    source: Box::new(failure.error),
                }
            })?;

        self.metrics.increment(&stats::published(&self.topic));
        debug!(
            topic = %self.topic,
            pipe = %message.pipe,
            message_id = %response.message_id,
            "Message published"
        );

        Ok(response)
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic)
            .field("retry", &self.retry)
            .finish()
    }
}
