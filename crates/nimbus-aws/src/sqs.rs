// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQS result queue.
//!
//! The queue is looked up by name and created when missing. Receives use
//! long polling; SQS caps a single receive at 10 messages and 20 seconds.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::MessageSystemAttributeName;
use nimbus_core::config::Settings;
use nimbus_core::result_channel::{QueueBinding, QueueError, QueueMessage, ResultQueue};
use tracing::{debug, info, warn};

use crate::error::{describe, is_transient};

/// Largest batch SQS returns from one receive.
pub const MAX_BATCH: usize = 10;

/// Longest long-poll SQS allows.
pub const MAX_WAIT: Duration = Duration::from_secs(20);

type QueueResult<T> = std::result::Result<T, QueueError>;

const NON_EXISTENT_QUEUE: &str = "AWS.SimpleQueueService.NonExistentQueue";
const QUEUE_ALREADY_EXISTS: &str = "QueueAlreadyExists";

/// SQS-backed [`ResultQueue`].
#[derive(Debug, Clone)]
pub struct SqsResultQueue {
    client: Client,
}

impl SqsResultQueue {
    /// Create a queue client from loaded SDK configuration.
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }

    /// Create a queue client for `settings`.
    pub async fn from_settings(settings: &Settings) -> Self {
        let config = crate::sdk_config::load(settings).await;
        Self::new(&config)
    }

    async fn queue_url(&self, queue_name: &str) -> QueueResult<Option<String>> {
        match self
            .client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
        {
            Ok(output) => Ok(output.queue_url().map(str::to_string)),
            Err(e) if is_missing_queue(&e) => Ok(None),
            Err(e) => Err(classify(e, queue_name)),
        }
    }
}

#[async_trait]
impl ResultQueue for SqsResultQueue {
    fn queue_type(&self) -> &'static str {
        "sqs"
    }

    async fn bind(&self, queue_name: &str) -> QueueResult<QueueBinding> {
        if let Some(url) = self.queue_url(queue_name).await? {
            debug!(queue = %queue_name, queue_url = %url, "SQS queue found");
            return Ok(QueueBinding {
                name: queue_name.to_string(),
                address: url,
                created: false,
            });
        }

        match self
            .client
            .create_queue()
            .queue_name(queue_name)
            .send()
            .await
        {
            Ok(output) => {
                let url = output.queue_url().map(str::to_string).ok_or_else(|| {
                    QueueError::Other(format!("CreateQueue returned no URL for {}", queue_name))
                })?;
                info!(queue = %queue_name, queue_url = %url, "SQS queue created");
                Ok(QueueBinding {
                    name: queue_name.to_string(),
                    address: url,
                    created: true,
                })
            }
            // Someone else created it between the lookup and the create.
            Err(e) if e.code() == Some(QUEUE_ALREADY_EXISTS) => {
                let url = self
                    .queue_url(queue_name)
                    .await?
                    .ok_or_else(|| QueueError::NotFound(queue_name.to_string()))?;
                Ok(QueueBinding {
                    name: queue_name.to_string(),
                    address: url,
                    created: false,
                })
            }
            Err(e) => Err(classify(e, queue_name)),
        }
    }

    async fn receive(
        &self,
        binding: &QueueBinding,
        max_messages: usize,
        wait: Duration,
    ) -> QueueResult<Vec<QueueMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&binding.address)
            .max_number_of_messages(max_messages.clamp(1, MAX_BATCH) as i32)
            .wait_time_seconds(wait.min(MAX_WAIT).as_secs() as i32)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| classify(e, &binding.name))?;

        let mut messages = Vec::new();
        for message in output.messages() {
            let Some(receipt) = message.receipt_handle() else {
                warn!(
                    queue = %binding.name,
                    message_id = ?message.message_id(),
                    "SQS message without receipt handle"
                );
                continue;
            };
            let receive_count = message
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|count| count.parse().ok())
                .unwrap_or(1);

            messages.push(QueueMessage {
                receipt: receipt.to_string(),
                body: message.body().unwrap_or_default().to_string(),
                receive_count,
            });
        }

        if !messages.is_empty() {
            debug!(queue = %binding.name, count = messages.len(), "Received SQS messages");
        }
        Ok(messages)
    }

    async fn acknowledge(&self, binding: &QueueBinding, receipt: &str) -> QueueResult<()> {
        self.client
            .delete_message()
            .queue_url(&binding.address)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| classify(e, &binding.name))?;
        Ok(())
    }
}

fn is_missing_queue<E, R>(err: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    matches!(
        err.code(),
        Some(NON_EXISTENT_QUEUE) | Some("QueueDoesNotExist")
    )
}

/// Map an SDK failure onto the queue error taxonomy.
fn classify<E, R>(err: SdkError<E, R>, queue_name: &str) -> QueueError
where
    E: std::error::Error + ProvideErrorMetadata + 'static,
    R: std::fmt::Debug + 'static,
{
    if is_transient(&err) {
        QueueError::Transient(describe(&err))
    } else if is_missing_queue(&err) {
        QueueError::NotFound(queue_name.to_string())
    } else {
        QueueError::Rejected(describe(&err))
    }
}
