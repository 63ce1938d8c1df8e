//! Broker client implementations.
//!
//! This module contains concrete implementations of the `QueueClient` and
//! `TopicClient` traits: signed HTTP clients for SQS and SNS, and an in-memory
//! broker that implements both.

pub mod aws;
pub mod memory;

pub use aws::{AwsClientConfig, AwsCredentials, AwsError, SnsClient, SqsClient};
pub use memory::{InMemoryBroker, InMemoryConfig, PublishedMessage};
