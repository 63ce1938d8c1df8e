//! Transport settings and their loading.
//!
//! Settings are layered with the `config` crate. Later sources override
//! earlier ones:
//!  1. Built-in defaults
//!  2. An optional settings file (YAML, TOML or JSON, chosen by extension)
//!  3. Environment variables prefixed `SNSSQS__` with `__` as the nesting
//!     separator, e.g. `SNSSQS__PUBLISH_RETRY__DELAY_MS=250`
//!
//! AWS keys left out of the settings fall back to the standard
//! `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`
//! variables when the clients are built.

use crate::client::{MAX_RECEIVE_BATCH, MAX_WAIT_TIME};
use crate::error::ConfigurationError;
use crate::message::{QueueUrl, TopicArn};
use crate::providers::{AwsClientConfig, AwsCredentials};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix of the environment variables read by [`TransportSettings::load`]
pub const ENV_PREFIX: &str = "SNSSQS";

const REDACTED: &str = "<redacted>";

/// Retry behaviour of topic publishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishRetrySettings {
    /// Total attempts including the first
    pub max_attempts: u32,

    /// Fixed pause between attempts
    pub delay_ms: u64,
}

impl Default for PublishRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay_ms: 5000,
        }
    }
}

/// StatsD metrics destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsdSettings {
    /// `host:port` of the StatsD daemon
    pub host: String,

    /// Prefix prepended to every stat name
    pub namespace: String,

    /// Fraction of samples sent, in `0.0..=1.0`
    pub sample_rate: f64,
}

impl Default for StatsdSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1:8125".to_string(),
            namespace: String::new(),
            sample_rate: 1.0,
        }
    }
}

/// Everything needed to connect a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,

    /// Queue the consumption loop polls
    pub consuming_sqs_queue_url: String,

    /// Topic every publish goes to
    pub publishing_sns_topic_arn: String,

    /// Long-poll wait of each receive (0-20)
    pub wait_time_seconds: u64,

    /// Batch size of each receive (1-10)
    pub max_number_of_messages: u32,

    /// Dispatches running at the same time within one poll cycle
    pub max_in_flight: usize,

    /// Pause after a failed receive before the next poll cycle
    pub receive_error_backoff_ms: u64,

    pub publish_retry: PublishRetrySettings,

    /// Endpoint overrides, e.g. for LocalStack
    pub sqs_endpoint: Option<String>,
    pub sns_endpoint: Option<String>,

    /// Metrics are disabled when absent
    pub statsd: Option<StatsdSettings>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            region: String::new(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            consuming_sqs_queue_url: String::new(),
            publishing_sns_topic_arn: String::new(),
            wait_time_seconds: 10,
            max_number_of_messages: 10,
            max_in_flight: 10,
            receive_error_backoff_ms: 1000,
            publish_retry: PublishRetrySettings::default(),
            sqs_endpoint: None,
            sns_endpoint: None,
            statsd: None,
        }
    }
}

impl TransportSettings {
    /// Settings with defaults for everything but the required identifiers
    pub fn new(
        region: impl Into<String>,
        consuming_sqs_queue_url: impl Into<String>,
        publishing_sns_topic_arn: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            consuming_sqs_queue_url: consuming_sqs_queue_url.into(),
            publishing_sns_topic_arn: publishing_sns_topic_arn.into(),
            ..Self::default()
        }
    }

    /// Load settings from an optional file and the environment, then validate
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Parsing`] when the file cannot be read or a
    /// value has the wrong type, and the errors of [`Self::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading transport settings from file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check required fields and value ranges
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.region.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "region".to_string(),
            });
        }

        if self.consuming_sqs_queue_url.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "consuming_sqs_queue_url".to_string(),
            });
        }
        self.queue_url()?;

        if self.publishing_sns_topic_arn.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "publishing_sns_topic_arn".to_string(),
            });
        }
        self.topic_arn()?;

        if self.wait_time_seconds > MAX_WAIT_TIME.as_secs() {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "wait_time_seconds must be between 0 and {}, got {}",
                    MAX_WAIT_TIME.as_secs(),
                    self.wait_time_seconds
                ),
            });
        }

        if !(1..=MAX_RECEIVE_BATCH).contains(&self.max_number_of_messages) {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "max_number_of_messages must be between 1 and {}, got {}",
                    MAX_RECEIVE_BATCH, self.max_number_of_messages
                ),
            });
        }

        if self.max_in_flight == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_in_flight must be at least 1".to_string(),
            });
        }

        if self.publish_retry.max_attempts == 0 {
            return Err(ConfigurationError::Invalid {
                message: "publish_retry.max_attempts must be at least 1".to_string(),
            });
        }

        if let Some(statsd) = &self.statsd {
            if statsd.host.trim().is_empty() {
                return Err(ConfigurationError::Missing {
                    key: "statsd.host".to_string(),
                });
            }
            if !(0.0..=1.0).contains(&statsd.sample_rate) {
                return Err(ConfigurationError::Invalid {
                    message: format!(
                        "statsd.sample_rate must be between 0 and 1, got {}",
                        statsd.sample_rate
                    ),
                });
            }
        }

        Ok(())
    }

    pub fn queue_url(&self) -> Result<QueueUrl, ConfigurationError> {
        QueueUrl::new(self.consuming_sqs_queue_url.clone()).map_err(|e| {
            ConfigurationError::Invalid {
                message: format!("consuming_sqs_queue_url: {}", e),
            }
        })
    }

    pub fn topic_arn(&self) -> Result<TopicArn, ConfigurationError> {
        TopicArn::new(self.publishing_sns_topic_arn.clone()).map_err(|e| {
            ConfigurationError::Invalid {
                message: format!("publishing_sns_topic_arn: {}", e),
            }
        })
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_seconds)
    }

    pub fn receive_error_backoff(&self) -> Duration {
        Duration::from_millis(self.receive_error_backoff_ms)
    }

    pub fn publish_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.publish_retry.max_attempts,
            Duration::from_millis(self.publish_retry.delay_ms),
        )
    }

    /// Keys from the settings, or from the standard AWS variables
    pub fn credentials(&self) -> Option<AwsCredentials> {
        let access_key_id = self
            .access_key_id
            .clone()
            .or_else(|| non_empty_env("AWS_ACCESS_KEY_ID"))?;
        let secret_access_key = self
            .secret_access_key
            .clone()
            .or_else(|| non_empty_env("AWS_SECRET_ACCESS_KEY"))?;
        let session_token = self
            .session_token
            .clone()
            .or_else(|| non_empty_env("AWS_SESSION_TOKEN"));

        let credentials = AwsCredentials::new(access_key_id, secret_access_key);
        Some(match session_token {
            Some(token) => credentials.with_session_token(token),
            None => credentials,
        })
    }

    pub fn sqs_client_config(&self) -> AwsClientConfig {
        AwsClientConfig {
            region: self.region.clone(),
            credentials: self.credentials(),
            endpoint: self.sqs_endpoint.clone(),
        }
    }

    pub fn sns_client_config(&self) -> AwsClientConfig {
        AwsClientConfig {
            region: self.region.clone(),
            credentials: self.credentials(),
            endpoint: self.sns_endpoint.clone(),
        }
    }

    /// Copy safe to print, with every secret replaced
    pub fn redacted(&self) -> Self {
        let redact = |value: &Option<String>| value.as_ref().map(|_| REDACTED.to_string());
        Self {
            secret_access_key: redact(&self.secret_access_key),
            session_token: redact(&self.session_token),
            ..self.clone()
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
