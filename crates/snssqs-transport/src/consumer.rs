//! Perpetual queue consumption.
//!
//! A [`Consumer`] polls the queue in cycles. Each cycle receives one batch,
//! normalizes every message, and dispatches the survivors to the handler
//! registered for their channel. Dispatches run concurrently, at most
//! `max_in_flight` at a time, and all of them finish before the next receive.
//!
//! Messages are routed on their `pipe` attribute: `keepalives` goes to the
//! keepalive handler, every other pipe to the default handler. Nothing is
//! acknowledged here; handlers acknowledge through the transport.

use crate::client::{QueueClient, ReceiveRequest};
use crate::envelope::normalize;
use crate::message::{QueueUrl, ReceivedMessage, KEEPALIVES_PIPE};
use crate::metrics::{stats, Metrics};
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

// ============================================================================
// Handlers and Routing
// ============================================================================

/// Receives the messages dispatched to a channel
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ReceivedMessage);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: ReceivedMessage) {
        (self)(message).await
    }
}

/// Handler slot a message is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Keepalives,
    Default,
}

impl Channel {
    pub fn for_pipe(pipe: &str) -> Self {
        if pipe == KEEPALIVES_PIPE {
            Self::Keepalives
        } else {
            Self::Default
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keepalives => write!(f, "keepalives"),
            Self::Default => write!(f, "default"),
        }
    }
}

type HandlerSlot = RwLock<Option<Arc<dyn MessageHandler>>>;

/// The two handler slots; registering again replaces the previous handler
#[derive(Default)]
pub struct Subscriptions {
    keepalives: HandlerSlot,
    default: HandlerSlot,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for the channel `pipe` routes to
    pub fn register(&self, pipe: &str, handler: Arc<dyn MessageHandler>) -> Channel {
        let channel = Channel::for_pipe(pipe);
        match self.slot(channel).write() {
            Ok(mut slot) => *slot = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }
        channel
    }

    pub fn handler(&self, channel: Channel) -> Option<Arc<dyn MessageHandler>> {
        match self.slot(channel).read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_registered(&self, channel: Channel) -> bool {
        self.handler(channel).is_some()
    }

    fn slot(&self, channel: Channel) -> &HandlerSlot {
        match channel {
            Channel::Keepalives => &self.keepalives,
            Channel::Default => &self.default,
        }
    }
}

impl std::fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriptions")
            .field("keepalives", &self.is_registered(Channel::Keepalives))
            .field("default", &self.is_registered(Channel::Default))
            .finish()
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Polling parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Batch size of each receive
    pub max_messages: u32,

    /// Long-poll wait of each receive
    pub wait_time: Duration,

    /// Concurrent dispatches within a cycle
    pub max_in_flight: usize,

    /// Pause after a failed receive
    pub receive_error_backoff: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait_time: Duration::from_secs(10),
            max_in_flight: 10,
            receive_error_backoff: Duration::from_secs(1),
        }
    }
}

/// Outcome of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Messages returned by the receive
    pub received: usize,

    /// Messages handed to a handler
    pub dispatched: usize,

    /// Messages dropped before dispatch
    pub discarded: usize,

    /// Handlers that panicked
    pub handler_panics: usize,

    /// The receive itself failed
    pub receive_failed: bool,
}

/// Polls one queue and dispatches to [`Subscriptions`]
#[derive(Clone)]
pub struct Consumer {
    client: Arc<dyn QueueClient>,
    queue: QueueUrl,
    settings: ConsumerSettings,
    subscriptions: Arc<Subscriptions>,
    metrics: Metrics,
    limiter: Arc<Semaphore>,
}

impl Consumer {
    pub fn new(
        client: Arc<dyn QueueClient>,
        queue: QueueUrl,
        settings: ConsumerSettings,
        subscriptions: Arc<Subscriptions>,
        metrics: Metrics,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));
        Self {
            client,
            queue,
            settings,
            subscriptions,
            metrics,
            limiter,
        }
    }

    pub fn queue(&self) -> &QueueUrl {
        &self.queue
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Run the poll loop on its own task on `runtime`; it never finishes on
    /// its own
    pub fn spawn(self, runtime: &Handle) -> JoinHandle<()> {
        runtime.spawn(self.run())
    }

    /// Poll forever. A failed receive pauses for `receive_error_backoff`
    /// before the next cycle.
    pub async fn run(self) {
        info!(
            queue = %self.queue,
            max_messages = self.settings.max_messages,
            wait_time_secs = self.settings.wait_time.as_secs(),
            max_in_flight = self.settings.max_in_flight,
            "Consumption loop started"
        );

        loop {
            let report = self.poll_once().await;

            if report.receive_failed {
                tokio::time::sleep(self.settings.receive_error_backoff).await;
            } else if report.received > 0 {
                debug!(
                    queue = %self.queue,
                    received = report.received,
                    dispatched = report.dispatched,
                    discarded = report.discarded,
                    "Poll cycle complete"
                );
            }
        }
    }

    /// Receive one batch and dispatch it, waiting for every dispatch to finish
    pub async fn poll_once(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let request = ReceiveRequest::new(self.settings.max_messages, self.settings.wait_time);

        let batch = match self.client.receive_messages(&self.queue, &request).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    error = %e,
                    "Failed to receive messages, treating batch as empty"
                );
                self.metrics.increment(&stats::receive_failed(&self.queue));
                report.receive_failed = true;
                return report;
            }
        };

        report.received = batch.len();
        let received_stat = stats::received(&self.queue);
        for _ in 0..batch.len() {
            self.metrics.increment(&received_stat);
        }

        let processed_stat = stats::processed(&self.queue);
        let mut dispatches = JoinSet::new();

        for message in batch {
            let Some((handler, message)) = self.route(message) else {
                self.metrics.increment(&stats::discarded(&self.queue));
                report.discarded += 1;
                continue;
            };

            let permit = match self.limiter.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "Dispatch limiter closed");
                    report.discarded += 1;
                    continue;
                }
            };

            let metrics = self.metrics.clone();
            let stat = processed_stat.clone();
            dispatches.spawn(async move {
                let _permit = permit;
                metrics.time(&stat, handler.handle(message)).await;
            });
            report.dispatched += 1;
        }

        while let Some(result) = dispatches.join_next().await {
            if let Err(e) = result {
                error!(queue = %self.queue, error = %e, "Message handler panicked");
                report.handler_panics += 1;
            }
        }

        report
    }

    /// Normalize `message` and find its handler, or log why it is dropped
    fn route(
        &self,
        message: ReceivedMessage,
    ) -> Option<(Arc<dyn MessageHandler>, ReceivedMessage)> {
        let message_id = message.message_id.clone();

        let message = match normalize(message) {
            Ok(message) => message,
            Err(reason) => {
                warn!(
                    queue = %self.queue,
                    message_id = %message_id,
                    reason = %reason,
                    "Discarding message that could not be normalized"
                );
                return None;
            }
        };

        let Some(pipe) = message.pipe() else {
            warn!(
                queue = %self.queue,
                message_id = %message_id,
                "Discarding message without a pipe attribute"
            );
            return None;
        };

        if message.body.is_empty() {
            warn!(
                queue = %self.queue,
                message_id = %message_id,
                pipe = %pipe,
                "Discarding message with an empty body"
            );
            return None;
        }

        let channel = Channel::for_pipe(pipe);
        let Some(handler) = self.subscriptions.handler(channel) else {
            warn!(
                queue = %self.queue,
                message_id = %message_id,
                channel = %channel,
                "No handler subscribed for channel, leaving message on the queue"
            );
            return None;
        };

        Some((handler, message))
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.queue)
            .field("settings", &self.settings)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}
