//! Envelope normalization for queue messages delivered by the topic.
//!
//! A topic subscription delivers to the queue in one of two shapes:
//!
//! - **Raw**: the message attributes live directly on the queue message and the
//!   body is the published payload.
//! - **Encapsulated**: the queue body is a JSON envelope written by the topic,
//!   carrying the payload under `Message` and the attributes under
//!   `MessageAttributes` as `{name: {"Type": "String", "Value": v}}`.
//!
//! [`normalize`] reconciles both into a single [`ReceivedMessage`] whose body is
//! the payload and whose attributes are plain strings. Messages that cannot be
//! reconciled yield a [`DiscardReason`]; callers log and drop them without
//! affecting the rest of the batch.

use crate::message::{Attributes, MessageId, ReceivedMessage, TopicArn};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;

const MESSAGE_FIELD: &str = "Message";
const MESSAGE_ATTRIBUTES_FIELD: &str = "MessageAttributes";
const VALUE_FIELD: &str = "Value";

/// Why a queue message was dropped before dispatch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscardReason {
    #[error("body is not a JSON envelope: {message}")]
    InvalidJson { message: String },

    #[error("envelope has no string `Message` field")]
    MissingMessage,

    #[error("envelope has no `MessageAttributes` object")]
    MissingMessageAttributes,
}

/// Reconcile a queue message into its canonical body and attributes.
///
/// Raw-shaped messages (attributes present) are returned unchanged.
pub fn normalize(message: ReceivedMessage) -> Result<ReceivedMessage, DiscardReason> {
    if message.is_raw_shaped() {
        return Ok(message);
    }

    let envelope: Value =
        serde_json::from_str(&message.body).map_err(|e| DiscardReason::InvalidJson {
            message: e.to_string(),
        })?;

    let body = envelope
        .get(MESSAGE_FIELD)
        .and_then(Value::as_str)
        .ok_or(DiscardReason::MissingMessage)?
        .to_string();

    let raw_attributes = envelope
        .get(MESSAGE_ATTRIBUTES_FIELD)
        .and_then(Value::as_object)
        .ok_or(DiscardReason::MissingMessageAttributes)?;

    let mut attributes = Attributes::new();
    for (name, entry) in raw_attributes {
        match entry.get(VALUE_FIELD) {
            Some(Value::String(value)) => {
                attributes.insert(name.clone(), value.clone());
            }
            Some(Value::Null) | None => {
                tracing::debug!(attribute = %name, "Skipping envelope attribute without a value");
            }
            Some(other) => {
                attributes.insert(name.clone(), other.to_string());
            }
        }
    }

    Ok(ReceivedMessage {
        body,
        attributes,
        ..message
    })
}

// ============================================================================
// Envelope Encoding
// ============================================================================

/// Attribute entry inside a topic envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeAttribute {
    #[serde(rename = "Type")]
    pub data_type: String,
    #[serde(rename = "Value")]
    pub value: String,
}

/// JSON envelope the topic writes to a queue without raw delivery enabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TopicEnvelope {
    #[serde(rename = "Type")]
    pub notification_type: String,
    pub message_id: String,
    pub topic_arn: String,
    pub message: String,
    pub timestamp: String,
    pub message_attributes: BTreeMap<String, EnvelopeAttribute>,
}

impl TopicEnvelope {
    /// Wrap a published body and its attributes the way the topic does
    pub fn new(
        message_id: &MessageId,
        topic: &TopicArn,
        body: &str,
        attributes: &Attributes,
    ) -> Self {
        let message_attributes = attributes
            .iter()
            .map(|(name, value)| {
                (
                    name.clone(),
                    EnvelopeAttribute {
                        data_type: "String".to_string(),
                        value: value.clone(),
                    },
                )
            })
            .collect();

        Self {
            notification_type: "Notification".to_string(),
            message_id: message_id.to_string(),
            topic_arn: topic.to_string(),
            message: body.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message_attributes,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
