// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Result queue trait definitions.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from result queue operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// The queue does not exist.
    #[error("Queue not found: {0}")]
    NotFound(String),

    /// Throttling, 5xx or connection failure; worth retrying.
    #[error("Transient queue error: {0}")]
    Transient(String),

    /// The service refused the request.
    #[error("Queue request rejected: {0}")]
    Rejected(String),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// A bound (existing or freshly created) queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    /// Queue name as configured.
    pub name: String,
    /// Service address used for send/receive (queue URL for SQS).
    pub address: String,
    /// Whether binding had to create the queue.
    pub created: bool,
}

/// A message received from the queue, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Opaque handle used to acknowledge this delivery.
    pub receipt: String,
    /// Raw message body.
    pub body: String,
    /// How many times this message has been delivered.
    pub receive_count: u32,
}

/// Trait for the shared result queue.
///
/// Delivery is at-least-once: a message that is received but never
/// acknowledged becomes visible again.
#[async_trait]
pub trait ResultQueue: Send + Sync {
    /// Queue type identifier (e.g., "sqs", "memory").
    fn queue_type(&self) -> &'static str;

    /// Resolve the queue by name, creating it if it does not exist.
    async fn bind(&self, queue_name: &str) -> Result<QueueBinding>;

    /// Receive up to `max_messages`, waiting at most `wait` for the first one.
    async fn receive(
        &self,
        binding: &QueueBinding,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>>;

    /// Remove a received message from the queue.
    async fn acknowledge(&self, binding: &QueueBinding, receipt: &str) -> Result<()>;
}
