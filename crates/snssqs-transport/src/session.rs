//! The transport session.
//!
//! [`Transport`] is created once per process with [`Transport::connect`]. It
//! owns the queue and topic clients and composes the consumer, publisher and
//! acknowledger around them. The consumption loop starts on the first
//! subscription that is not a fan-out one and then runs for the life of the
//! process.

use crate::acknowledger::Acknowledger;
use crate::client::{QueueClient, TopicClient};
use crate::config::TransportSettings;
use crate::consumer::{Channel, Consumer, ConsumerSettings, MessageHandler, Subscriptions};
use crate::error::TransportError;
use crate::message::{
    Attributes, Classification, OutboundMessage, PublishResponse, QueueUrl, ReceivedMessage,
    TopicArn,
};
use crate::metrics::{Metrics, StatsdSink};
use crate::providers::{SnsClient, SqsClient};
use crate::publisher::Publisher;
use crate::retry::RetryPolicy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;

/// Invoked with the broker response after a successful publish
pub type PublishCallback = Box<dyn FnOnce(PublishResponse) + Send + 'static>;

/// Invoked with the original message after a successful acknowledgement
pub type AcknowledgeCallback = Box<dyn FnOnce(ReceivedMessage) + Send + 'static>;

/// Identifiers and tuning a transport is built from
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub queue: QueueUrl,
    pub topic: TopicArn,
    pub consumer: ConsumerSettings,
    pub publish_retry: RetryPolicy,
}

impl SessionOptions {
    pub fn new(queue: QueueUrl, topic: TopicArn) -> Self {
        Self {
            queue,
            topic,
            consumer: ConsumerSettings::default(),
            publish_retry: RetryPolicy::default(),
        }
    }

    pub fn from_settings(settings: &TransportSettings) -> Result<Self, TransportError> {
        Ok(Self {
            queue: settings.queue_url()?,
            topic: settings.topic_arn()?,
            consumer: ConsumerSettings {
                max_messages: settings.max_number_of_messages,
                wait_time: settings.wait_time(),
                max_in_flight: settings.max_in_flight,
                receive_error_backoff: settings.receive_error_backoff(),
            },
            publish_retry: settings.publish_retry_policy(),
        })
    }
}

/// A connected SNS/SQS transport
pub struct Transport {
    queue_client: Arc<dyn QueueClient>,
    topic_client: Arc<dyn TopicClient>,
    subscriptions: Arc<Subscriptions>,
    consumer: Consumer,
    publisher: Publisher,
    acknowledger: Acknowledger,
    metrics: Metrics,
    consuming: AtomicBool,
}

impl Transport {
    /// Build the AWS clients and metrics described by `settings`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] for invalid settings or an
    /// unusable StatsD host.
    pub fn connect(settings: &TransportSettings) -> Result<Self, TransportError> {
        settings.validate()?;

        let queue_client = SqsClient::new(settings.sqs_client_config())
            .map_err(|e| e.to_transport_error("Sqs"))?;
        let topic_client = SnsClient::new(settings.sns_client_config())
            .map_err(|e| e.to_transport_error("Sns"))?;

        let metrics = match &settings.statsd {
            Some(statsd) => {
                let sink = StatsdSink::new(&statsd.host, &statsd.namespace)?;
                Metrics::new(Arc::new(sink), statsd.sample_rate)
            }
            None => Metrics::disabled(),
        };

        let transport = Self::with_clients(
            Arc::new(queue_client),
            Arc::new(topic_client),
            SessionOptions::from_settings(settings)?,
            metrics,
        );

        info!(
            queue = %transport.queue(),
            topic = %transport.topic(),
            metrics_enabled = transport.metrics.is_enabled(),
            "Transport connected"
        );

        Ok(transport)
    }

    /// Compose a transport around existing clients
    pub fn with_clients(
        queue_client: Arc<dyn QueueClient>,
        topic_client: Arc<dyn TopicClient>,
        options: SessionOptions,
        metrics: Metrics,
    ) -> Self {
        let subscriptions = Arc::new(Subscriptions::new());
        let consumer = Consumer::new(
            queue_client.clone(),
            options.queue.clone(),
            options.consumer,
            subscriptions.clone(),
            metrics.clone(),
        );
        let publisher = Publisher::new(
            topic_client.clone(),
            options.topic,
            options.publish_retry,
            metrics.clone(),
        );
        let acknowledger = Acknowledger::new(queue_client.clone(), options.queue, metrics.clone());

        Self {
            queue_client,
            topic_client,
            subscriptions,
            consumer,
            publisher,
            acknowledger,
            metrics,
            consuming: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &QueueUrl {
        self.consumer.queue()
    }

    pub fn topic(&self) -> &TopicArn {
        self.publisher.topic()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn queue_client(&self) -> Arc<dyn QueueClient> {
        self.queue_client.clone()
    }

    pub fn topic_client(&self) -> Arc<dyn TopicClient> {
        self.topic_client.clone()
    }

    /// A transport only exists once both clients are built, and it never
    /// disconnects
    pub fn is_connected(&self) -> bool {
        true
    }

    /// Whether the consumption loop has been started
    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::SeqCst)
    }

    /// Register `handler` for the channel `pipe` routes to.
    ///
    /// Fan-out subscriptions are logged and ignored, returning `None`. The
    /// first other subscription starts the consumption loop on the current
    /// Tokio runtime. `funnel` and `options` carry no meaning here.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Validation`] for an empty classification and
    /// [`TransportError::TaskFailed`] when the loop has to be started outside
    /// a Tokio runtime. Nothing is registered in either case.
    pub fn subscribe<H>(
        &self,
        classification: &str,
        pipe: &str,
        funnel: Option<&str>,
        options: &Attributes,
        handler: H,
    ) -> Result<Option<Channel>, TransportError>
    where
        H: MessageHandler + 'static,
    {
        let classification = Classification::new(classification)?;
        if classification.is_fanout() {
            info!(
                classification = %classification,
                pipe = %pipe,
                "Fan-out subscriptions are not supported by this transport, ignoring"
            );
            return Ok(None);
        }

        // The loop is spawned on the caller's runtime; without one the
        // subscription is refused and the loop stays startable
        let runtime = if self.is_consuming() {
            None
        } else {
            Some(Handle::try_current().map_err(|e| TransportError::TaskFailed {
                message: format!("consumption loop needs a Tokio runtime: {}", e),
            })?)
        };

        let channel = self.subscriptions.register(pipe, Arc::new(handler));
        debug!(
            classification = %classification,
            pipe = %pipe,
            channel = %channel,
            funnel = funnel.unwrap_or_default(),
            ignored_options = options.len(),
            "Handler subscribed"
        );

        if let Some(runtime) = runtime {
            if self
                .consuming
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                // Detached; the loop lives as long as the runtime
                drop(self.consumer.clone().spawn(&runtime));
            }
        }

        Ok(Some(channel))
    }

    /// Delete `message` from the queue on a background task, then call
    /// `callback` with it.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn acknowledge(
        &self,
        message: ReceivedMessage,
        callback: Option<AcknowledgeCallback>,
    ) -> JoinHandle<Result<(), TransportError>> {
        let acknowledger = self.acknowledger.clone();
        tokio::spawn(async move {
            acknowledger.acknowledge(&message).await?;
            if let Some(callback) = callback {
                callback(message);
            }
            Ok(())
        })
    }

    /// Publish to the topic on a background task, then call `callback` with
    /// the broker response.
    ///
    /// `options` become extra message attributes; they never override
    /// `type` (the classification) or `pipe`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn publish(
        &self,
        classification: &str,
        pipe: &str,
        body: impl Into<String>,
        options: Attributes,
        callback: Option<PublishCallback>,
    ) -> JoinHandle<Result<PublishResponse, TransportError>> {
        let publisher = self.publisher.clone();
        let message = OutboundMessage::new(classification, pipe, body).with_attributes(options);
        tokio::spawn(async move {
            let response = publisher.publish(&message).await?;
            if let Some(callback) = callback {
                callback(response.clone());
            }
            Ok(response)
        })
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("queue", self.queue())
            .field("topic", self.topic())
            .field("subscriptions", &self.subscriptions)
            .field("consuming", &self.is_consuming())
            .finish()
    }
}
