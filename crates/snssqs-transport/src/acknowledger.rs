//! Removal of consumed messages from the queue.

use crate::client::QueueClient;
use crate::error::TransportError;
use crate::message::{QueueUrl, ReceivedMessage};
use crate::metrics::{stats, Metrics};
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "acknowledger_tests.rs"]
mod tests;

/// Deletes received messages by their receipt handle
#[derive(Clone)]
pub struct Acknowledger {
    client: Arc<dyn QueueClient>,
    queue: QueueUrl,
    metrics: Metrics,
}

impl Acknowledger {
    pub fn new(client: Arc<dyn QueueClient>, queue: QueueUrl, metrics: Metrics) -> Self {
        Self {
            client,
            queue,
            metrics,
        }
    }

    pub fn queue(&self) -> &QueueUrl {
        &self.queue
    }

    /// Delete `message` from the queue. Not retried: an unacknowledged message
    /// is redelivered once its visibility timeout expires.
    pub async fn acknowledge(&self, message: &ReceivedMessage) -> Result<(), TransportError> {
        if let Err(e) = self
            .client
            .delete_message(&self.queue, &message.receipt_handle)
            .await
        {
            warn!(
                queue = %self.queue,
                message_id = %message.message_id,
                error = %e,
                "Failed to delete message"
            );
            return Err(e);
        }

        self.metrics.increment(&stats::deleted(&self.queue));
        debug!(
            queue = %self.queue,
            message_id = %message.message_id,
            "Message deleted"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acknowledger")
            .field("queue", &self.queue)
            .finish()
    }
}
