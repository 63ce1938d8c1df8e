//! Message types for the transport including core domain identifiers.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Attribute carrying the logical sub-channel of a message
pub const PIPE_ATTRIBUTE: &str = "pipe";

/// Attribute carrying the publisher's classification of a message
pub const TYPE_ATTRIBUTE: &str = "type";

/// Pipe value routed to the keepalive channel
pub const KEEPALIVES_PIPE: &str = "keepalives";

/// Classification denoting a broadcast subscription
pub const FANOUT_CLASSIFICATION: &str = "fanout";

/// Opaque string attributes carried alongside a message body.
///
/// Ordered so that outbound attribute entries are numbered deterministically.
pub type Attributes = BTreeMap<String, String>;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated URL of the queue the transport consumes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueUrl(String);

impl QueueUrl {
    /// Create new queue URL with validation
    pub fn new(url: String) -> Result<Self, ValidationError> {
        if url.is_empty() {
            return Err(ValidationError::Required {
                field: "queue_url".to_string(),
            });
        }

        let parsed = url::Url::parse(&url).map_err(|e| ValidationError::InvalidFormat {
            field: "queue_url".to_string(),
            message: e.to_string(),
        })?;

        if parsed.scheme() != "https" && parsed.scheme() != "http" {
            return Err(ValidationError::InvalidFormat {
                field: "queue_url".to_string(),
                message: "must be an http(s) URL".to_string(),
            });
        }

        let has_name = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .is_some_and(|last| !last.is_empty());
        if !has_name {
            return Err(ValidationError::InvalidFormat {
                field: "queue_url".to_string(),
                message: "path must end with the queue name".to_string(),
            });
        }

        Ok(Self(url))
    }

    /// Queue name, the final path segment of the URL
    pub fn name(&self) -> &str {
        self.0
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.0)
    }

    /// Get queue URL as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueUrl {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Validated ARN of the topic the transport publishes to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicArn(String);

impl TopicArn {
    /// Create new topic ARN with validation
    ///
    /// Expected shape: `arn:<partition>:sns:<region>:<account>:<name>`
    pub fn new(arn: String) -> Result<Self, ValidationError> {
        if arn.is_empty() {
            return Err(ValidationError::Required {
                field: "topic_arn".to_string(),
            });
        }

        let parts: Vec<&str> = arn.split(':').collect();
        if parts.len() != 6 || parts[0] != "arn" || parts[2] != "sns" || parts[5].is_empty() {
            return Err(ValidationError::InvalidFormat {
                field: "topic_arn".to_string(),
                message: "expected arn:<partition>:sns:<region>:<account>:<name>".to_string(),
            });
        }

        Ok(Self(arn))
    }

    /// Topic name, the final ARN component
    pub fn name(&self) -> &str {
        self.0.rsplit(':').next().unwrap_or(&self.0)
    }

    /// Get topic ARN as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TopicArn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TopicArn {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Broker-assigned message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque token returned with a received message, required to delete it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: String) -> Self {
        Self(handle)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription or publish classification, e.g. `direct` or `fanout`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Classification(String);

impl Classification {
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ValidationError::Required {
                field: "classification".to_string(),
            });
        }
        Ok(Self(value))
    }

    /// Broadcast subscriptions are not driven by this transport
    pub fn is_fanout(&self) -> bool {
        self.0 == FANOUT_CLASSIFICATION
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message as received from the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub body: String,
    pub attributes: Attributes,
    pub receipt_handle: ReceiptHandle,
}

impl ReceivedMessage {
    pub fn new(
        message_id: MessageId,
        body: impl Into<String>,
        attributes: Attributes,
        receipt_handle: ReceiptHandle,
    ) -> Self {
        Self {
            message_id,
            body: body.into(),
            attributes,
            receipt_handle,
        }
    }

    /// The `pipe` attribute, if present and non-empty
    pub fn pipe(&self) -> Option<&str> {
        self.attributes
            .get(PIPE_ATTRIBUTE)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }

    /// The `type` attribute, if present
    pub fn message_type(&self) -> Option<&str> {
        self.attributes.get(TYPE_ATTRIBUTE).map(String::as_str)
    }

    /// Raw deliveries carry their attributes on the queue message itself
    pub fn is_raw_shaped(&self) -> bool {
        !self.attributes.is_empty()
    }
}

/// A message about to be published to the topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub classification: String,
    pub pipe: String,
    pub body: String,
    pub attributes: Attributes,
}

impl OutboundMessage {
    pub fn new(
        classification: impl Into<String>,
        pipe: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            classification: classification.into(),
            pipe: pipe.into(),
            body: body.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.extend(attributes);
        self
    }

    /// Check the required tags are present
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.classification.is_empty() {
            return Err(ValidationError::Required {
                field: TYPE_ATTRIBUTE.to_string(),
            });
        }
        if self.pipe.is_empty() {
            return Err(ValidationError::Required {
                field: PIPE_ATTRIBUTE.to_string(),
            });
        }
        Ok(())
    }

    /// Attribute set sent with the publish: caller attributes plus the fixed
    /// `type` and `pipe` tags, which always take precedence.
    pub fn message_attributes(&self) -> Attributes {
        let mut attributes = self.attributes.clone();
        attributes.insert(TYPE_ATTRIBUTE.to_string(), self.classification.clone());
        attributes.insert(PIPE_ATTRIBUTE.to_string(), self.pipe.clone());
        attributes
    }
}

/// Broker response to a successful topic publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub message_id: MessageId,
    pub request_id: Option<String>,
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
