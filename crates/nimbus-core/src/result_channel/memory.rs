// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process result queue.
//!
//! Mirrors the delivery semantics of a hosted queue closely enough for
//! tests and local runs: long-polling receives, receipts, and redelivery of
//! messages that were received but never acknowledged.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::traits::{QueueBinding, QueueError, QueueMessage, ResultQueue, Result};

const ADDRESS_PREFIX: &str = "memory://";

/// Longest single park while waiting for messages.
const MAX_PARK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct StoredMessage {
    body: String,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, StoredMessage>,
}

/// In-memory [`ResultQueue`].
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    next_receipt: AtomicU64,
    failing_receives: AtomicUsize,
}

impl InMemoryQueue {
    /// Create an empty queue service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Address a queue name is reachable at.
    pub fn address_of(name: &str) -> String {
        format!("{}{}", ADDRESS_PREFIX, name)
    }

    /// Post a message; `queue` may be a bound address or a plain name.
    pub fn send(&self, queue: &str, body: impl Into<String>) -> Result<()> {
        let name = queue.strip_prefix(ADDRESS_PREFIX).unwrap_or(queue);
        {
            let mut queues = self.lock();
            let state = queues
                .get_mut(name)
                .ok_or_else(|| QueueError::NotFound(name.to_string()))?;
            state.ready.push_back(StoredMessage {
                body: body.into(),
                receive_count: 0,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Make the next `count` receives fail with a transient error.
    pub fn fail_next_receives(&self, count: usize) {
        self.failing_receives.store(count, Ordering::SeqCst);
    }

    /// Return every in-flight message of `queue` to the ready list,
    /// as an expired visibility timeout would.
    pub fn redeliver_in_flight(&self, queue: &str) -> usize {
        let name = queue.strip_prefix(ADDRESS_PREFIX).unwrap_or(queue);
        let moved = {
            let mut queues = self.lock();
            let Some(state) = queues.get_mut(name) else {
                return 0;
            };
            let moved: Vec<StoredMessage> = state.in_flight.drain().map(|(_, m)| m).collect();
            let count = moved.len();
            state.ready.extend(moved);
            count
        };
        if moved > 0 {
            self.notify.notify_waiters();
        }
        moved
    }

    /// Messages waiting to be received.
    pub fn ready_len(&self, queue: &str) -> usize {
        let name = queue.strip_prefix(ADDRESS_PREFIX).unwrap_or(queue);
        self.lock().get(name).map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Messages received but not yet acknowledged.
    pub fn in_flight_len(&self, queue: &str) -> usize {
        let name = queue.strip_prefix(ADDRESS_PREFIX).unwrap_or(queue);
        self.lock().get(name).map(|s| s.in_flight.len()).unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_ready(&self, name: &str, max_messages: usize) -> Result<Vec<QueueMessage>> {
        let mut queues = self.lock();
        let state = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::NotFound(name.to_string()))?;

        let mut received = Vec::new();
        while received.len() < max_messages {
            let Some(mut message) = state.ready.pop_front() else {
                break;
            };
            message.receive_count += 1;
            let receipt = format!(
                "{}-{}",
                name,
                self.next_receipt.fetch_add(1, Ordering::SeqCst)
            );
            received.push(QueueMessage {
                receipt: receipt.clone(),
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
            state.in_flight.insert(receipt, message);
        }
        Ok(received)
    }
}

#[async_trait]
impl ResultQueue for InMemoryQueue {
    fn queue_type(&self) -> &'static str {
        "memory"
    }

    async fn bind(&self, queue_name: &str) -> Result<QueueBinding> {
        let mut queues = self.lock();
        let created = !queues.contains_key(queue_name);
        if created {
            debug!(queue = queue_name, "Creating in-memory queue");
            queues.insert(queue_name.to_string(), QueueState::default());
        }
        Ok(QueueBinding {
            name: queue_name.to_string(),
            address: Self::address_of(queue_name),
            created,
        })
    }

    async fn receive(
        &self,
        binding: &QueueBinding,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>> {
        if self
            .failing_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(QueueError::Transient("simulated receive failure".to_string()));
        }

        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let received = self.take_ready(&binding.name, max_messages.max(1))?;
            if !received.is_empty() {
                return Ok(received);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let park = (deadline - now).min(MAX_PARK);
            let _ = tokio::time::timeout(park, notified).await;
        }
    }

    async fn acknowledge(&self, binding: &QueueBinding, receipt: &str) -> Result<()> {
        let mut queues = self.lock();
        let state = queues
            .get_mut(&binding.name)
            .ok_or_else(|| QueueError::NotFound(binding.name.clone()))?;
        if state.in_flight.remove(receipt).is_none() {
            debug!(queue = %binding.name, receipt, "Acknowledged unknown receipt");
        }
        Ok(())
    }
}
