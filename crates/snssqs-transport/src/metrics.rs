//! Optional counters and timers around transport operations.
//!
//! [`Metrics`] wraps an optional [`MetricsSink`]. Without a sink every call is a
//! no-op, except [`Metrics::time`] which still runs the timed body. Stat names
//! come from the templates in [`stats`], scoped by queue or topic name.

use crate::error::ConfigurationError;
use crate::message::{QueueUrl, TopicArn};
use cadence::prelude::*;
use cadence::{StatsdClient, UdpMetricSink};
use std::fmt;
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;

/// Backend receiving counter and timer samples
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// Add one to a counter
    fn increment(&self, stat: &str, sample_rate: f64);

    /// Record a duration in milliseconds
    fn timing(&self, stat: &str, millis: u64, sample_rate: f64);
}

/// Handle used by the transport components to report metrics
#[derive(Clone, Debug)]
pub struct Metrics {
    sink: Option<Arc<dyn MetricsSink>>,
    sample_rate: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::disabled()
    }
}

impl Metrics {
    /// Metrics handle that reports nothing
    pub fn disabled() -> Self {
        Self {
            sink: None,
            sample_rate: 1.0,
        }
    }

    /// Report to `sink`, applying `sample_rate` (clamped to 0..=1) to every stat
    pub fn new(sink: Arc<dyn MetricsSink>, sample_rate: f64) -> Self {
        Self {
            sink: Some(sink),
            sample_rate: sample_rate.clamp(0.0, 1.0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn increment(&self, stat: &str) {
        if let Some(sink) = &self.sink {
            sink.increment(stat, self.sample_rate);
        }
    }

    /// Run `body` to completion, reporting its duration under `stat` when a
    /// sink is configured
    pub async fn time<F, T>(&self, stat: &str, body: F) -> T
    where
        F: Future<Output = T>,
    {
        let Some(sink) = &self.sink else {
            return body.await;
        };

        let started = Instant::now();
        let result = body.await;
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        sink.timing(stat, elapsed, self.sample_rate);
        result
    }
}

/// Stat name templates
pub mod stats {
    use super::*;

    pub fn published(topic: &TopicArn) -> String {
        format!("sns.{}.message.published", topic.name())
    }

    pub fn deleted(queue: &QueueUrl) -> String {
        format!("sqs.{}.message.deleted", queue.name())
    }

    pub fn processed(queue: &QueueUrl) -> String {
        format!("sqs.{}.message.processed", queue.name())
    }

    pub fn received(queue: &QueueUrl) -> String {
        format!("sqs.{}.message.received", queue.name())
    }

    pub fn discarded(queue: &QueueUrl) -> String {
        format!("sqs.{}.message.discarded", queue.name())
    }

    pub fn receive_failed(queue: &QueueUrl) -> String {
        format!("sqs.{}.receive.failed", queue.name())
    }
}

// ============================================================================
// StatsD Sink
// ============================================================================

/// Fire-and-forget StatsD client over UDP, backed by [`cadence`].
///
/// Stats are prefixed with the namespace. Sampling is decided here and the
/// rate is tagged on the line (`|@rate`). Send failures are logged at debug
/// level and otherwise ignored.
pub struct StatsdSink {
    client: StatsdClient,
    target: SocketAddr,
}

impl StatsdSink {
    /// Create a sink sending to `host` (`host:port`) with stats prefixed by
    /// `namespace`
    pub fn new(host: &str, namespace: &str) -> Result<Self, ConfigurationError> {
        let target = host
            .to_socket_addrs()
            .map_err(|e| ConfigurationError::Invalid {
                message: format!("statsd host '{}' could not be resolved: {}", host, e),
            })?
            .next()
            .ok_or_else(|| ConfigurationError::Invalid {
                message: format!("statsd host '{}' resolved to no addresses", host),
            })?;

        let bind_addr = if target.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).map_err(|e| ConfigurationError::Invalid {
            message: format!("failed to bind statsd socket: {}", e),
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ConfigurationError::Invalid {
                message: format!("failed to configure statsd socket: {}", e),
            })?;
        let sink = UdpMetricSink::from(target, socket).map_err(|e| ConfigurationError::Invalid {
            message: format!("failed to create statsd sink: {}", e),
        })?;

        let client = StatsdClient::builder(namespace, sink)
            .with_error_handler(|e| {
                tracing::debug!(error = %e, "Failed to send statsd sample");
            })
            .build();

        Ok(Self { client, target })
    }
}

/// Whether a sample at `sample_rate` should be sent
fn sampled(sample_rate: f64) -> bool {
    sample_rate >= 1.0 || rand::random::<f64>() < sample_rate
}

impl fmt::Debug for StatsdSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsdSink")
            .field("target", &self.target)
            .field("client", &self.client)
            .finish()
    }
}

impl MetricsSink for StatsdSink {
    fn increment(&self, stat: &str, sample_rate: f64) {
        if !sampled(sample_rate) {
            return;
        }
        let metric = self.client.count_with_tags(stat, 1_i64);
        if sample_rate < 1.0 {
            metric.with_sampling_rate(sample_rate).send();
        } else {
            metric.send();
        }
    }

    fn timing(&self, stat: &str, millis: u64, sample_rate: f64) {
        if !sampled(sample_rate) {
            return;
        }
        let metric = self.client.time_with_tags(stat, millis);
        if sample_rate < 1.0 {
            metric.with_sampling_rate(sample_rate).send();
        } else {
            metric.send();
        }
    }
}

// ============================================================================
// In-Memory Sink
// ============================================================================

/// A metric sample captured by [`InMemorySink`]
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Increment { stat: String, sample_rate: f64 },
    Timing { stat: String, millis: u64, sample_rate: f64 },
}

impl Sample {
    pub fn stat(&self) -> &str {
        match self {
            Self::Increment { stat, .. } | Self::Timing { stat, .. } => stat,
        }
    }
}

/// Sink that keeps every sample in memory, for development and tests
#[derive(Debug, Default)]
pub struct InMemorySink {
    samples: Mutex<Vec<Sample>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples
            .lock()
            .map(|samples| samples.clone())
            .unwrap_or_default()
    }

    /// Number of increments recorded for `stat`
    pub fn count(&self, stat: &str) -> usize {
        self.samples()
            .iter()
            .filter(|s| matches!(s, Sample::Increment { stat: name, .. } if name == stat))
            .count()
    }

    /// Number of timings recorded for `stat`
    pub fn timings(&self, stat: &str) -> usize {
        self.samples()
            .iter()
            .filter(|s| matches!(s, Sample::Timing { stat: name, .. } if name == stat))
            .count()
    }

    fn record(&self, sample: Sample) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(sample);
        }
    }
}

impl MetricsSink for InMemorySink {
    fn increment(&self, stat: &str, sample_rate: f64) {
        self.record(Sample::Increment {
            stat: stat.to_string(),
            sample_rate,
        });
    }

    fn timing(&self, stat: &str, millis: u64, sample_rate: f64) {
        self.record(Sample::Timing {
            stat: stat.to_string(),
            millis,
            sample_rate,
        });
    }
}
