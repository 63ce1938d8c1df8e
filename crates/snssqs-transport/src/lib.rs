//! # SNS/SQS Transport
//!
//! Publish/subscribe transport built from an SQS queue and an SNS topic.
//!
//! This library provides:
//! - A perpetual queue consumer with bounded-concurrency dispatch
//! - Normalization of raw and topic-enveloped queue messages
//! - Topic publishing with fixed-delay retry
//! - Explicit acknowledgement by receipt handle
//! - Optional StatsD counters and timers
//!
//! ## Module Organization
//!
//! - [`session`] - The [`Transport`] tying everything together
//! - [`consumer`] - Poll loop, handler slots and routing
//! - [`publisher`] / [`acknowledger`] - Topic publish and queue delete
//! - [`envelope`] - Wire shape normalization
//! - [`client`] / [`providers`] - Broker client traits and implementations
//! - [`config`] - Layered transport settings
//! - [`metrics`] - Metrics wrapper and sinks
//!
//! ## Example
//!
//! ```no_run
//! use snssqs_transport::{Attributes, ReceivedMessage, Transport, TransportSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = TransportSettings::load(None)?;
//! let transport = Transport::connect(&settings)?;
//!
//! transport.subscribe(
//!     "direct",
//!     "results",
//!     None,
//!     &Attributes::new(),
//!     |message: ReceivedMessage| async move {
//!         println!("{}", message.body);
//!     },
//! )?;
//!
//! transport
//!     .publish("direct", "results", "{\"status\":0}", Attributes::new(), None)
//!     .await??;
//! # Ok(())
//! # }
//! ```

// Module declarations
pub mod acknowledger;
pub mod client;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod message;
pub mod metrics;
pub mod providers;
pub mod publisher;
pub mod retry;
pub mod session;

// Re-export commonly used types at crate root for convenience
pub use client::{QueueClient, ReceiveRequest, TopicClient};
pub use config::{PublishRetrySettings, StatsdSettings, TransportSettings};
pub use consumer::{Channel, ConsumerSettings, CycleReport, MessageHandler};
pub use envelope::{normalize, DiscardReason};
pub use error::{ConfigurationError, TransportError, ValidationError};
pub use message::{
    Attributes, MessageId, OutboundMessage, PublishResponse, QueueUrl, ReceiptHandle,
    ReceivedMessage, TopicArn,
};
pub use metrics::{Metrics, MetricsSink, StatsdSink};
pub use retry::RetryPolicy;
pub use session::{AcknowledgeCallback, PublishCallback, SessionOptions, Transport};
