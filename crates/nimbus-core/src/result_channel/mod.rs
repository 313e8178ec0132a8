// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Result channel.
//!
//! Consumes result envelopes from the shared queue and routes each one to
//! the pending invocation with the same correlation id. A configurable
//! number of receive loops run concurrently; each message is acknowledged
//! only after it has been routed (or found to be unusable), so a crash in
//! between leads to redelivery rather than loss. Redelivered duplicates
//! resolve nothing because the first delivery already removed the entry.

mod envelope;
mod memory;
mod traits;

pub use envelope::{EnvelopeStatus, ResultEnvelope};
pub use memory::InMemoryQueue;
pub use traits::{QueueBinding, QueueError, QueueMessage, ResultQueue};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::execution_store::{ExecutionStore, Resolution};

/// Problems observed while consuming the queue. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelDiagnostic {
    /// A result arrived for an id that is not pending.
    UnmatchedResult {
        /// The unknown correlation id.
        correlation_id: String,
    },
    /// A message could not be parsed as a result envelope.
    MalformedMessage {
        /// Parser error.
        reason: String,
    },
}

impl std::fmt::Display for ChannelDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelDiagnostic::UnmatchedResult { correlation_id } => {
                write!(f, "unmatched result for {}", correlation_id)
            }
            ChannelDiagnostic::MalformedMessage { reason } => {
                write!(f, "malformed message: {}", reason)
            }
        }
    }
}

/// Result channel tuning.
#[derive(Debug, Clone)]
pub struct ResultChannelConfig {
    /// Queue to bind (created if missing).
    pub queue_name: String,
    /// Number of concurrent receive loops.
    pub receivers: usize,
    /// Maximum messages per receive.
    pub batch_size: usize,
    /// Long-poll wait per receive.
    pub receive_wait: Duration,
    /// Pause after a failed receive.
    pub error_backoff: Duration,
}

impl Default for ResultChannelConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ResultChannelConfig {
    /// Derive from runtime settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            queue_name: settings.queue_name.clone(),
            receivers: settings.receive_concurrency,
            batch_size: settings.receive_batch_size,
            receive_wait: settings.receive_wait,
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Counters maintained by the receive loops.
#[derive(Debug, Default)]
pub struct ChannelStats {
    received: AtomicU64,
    resolved: AtomicU64,
    unmatched: AtomicU64,
    malformed: AtomicU64,
    receive_errors: AtomicU64,
    ack_errors: AtomicU64,
}

/// Point-in-time copy of [`ChannelStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    /// Messages received.
    pub received: u64,
    /// Results handed to a waiting caller.
    pub resolved: u64,
    /// Results with no pending invocation (including abandoned ones).
    pub unmatched: u64,
    /// Messages that were not valid envelopes.
    pub malformed: u64,
    /// Failed receive calls.
    pub receive_errors: u64,
    /// Failed acknowledgements.
    pub ack_errors: u64,
}

impl ChannelStats {
    /// Take a snapshot of all counters.
    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            ack_errors: self.ack_errors.load(Ordering::Relaxed),
        }
    }
}

/// Not-yet-started result channel.
pub struct ResultChannel {
    queue: Arc<dyn ResultQueue>,
    store: Arc<ExecutionStore>,
    config: ResultChannelConfig,
}

impl ResultChannel {
    /// Create a channel routing `queue` messages into `store`.
    pub fn new(
        queue: Arc<dyn ResultQueue>,
        store: Arc<ExecutionStore>,
        config: ResultChannelConfig,
    ) -> Self {
        Self {
            queue,
            store,
            config,
        }
    }

    /// Bind the queue and spawn the receive loops.
    pub async fn start(self) -> Result<RunningChannel> {
        let binding = self.queue.bind(&self.config.queue_name).await?;
        let receivers = self.config.receivers.max(1);

        info!(
            queue = %binding.name,
            address = %binding.address,
            queue_type = self.queue.queue_type(),
            created = binding.created,
            receivers,
            "Result channel started"
        );

        let stats = Arc::new(ChannelStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = (0..receivers)
            .map(|worker| {
                let consumer = Consumer {
                    worker,
                    queue: self.queue.clone(),
                    store: self.store.clone(),
                    binding: binding.clone(),
                    stats: stats.clone(),
                    config: self.config.clone(),
                };
                tokio::spawn(consumer.run(shutdown_rx.clone()))
            })
            .collect();

        Ok(RunningChannel {
            binding,
            stats,
            shutdown_tx,
            tasks,
        })
    }
}

/// Handle to a started result channel.
pub struct RunningChannel {
    binding: QueueBinding,
    stats: Arc<ChannelStats>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningChannel {
    /// Address remote functions post results to.
    pub fn queue_address(&self) -> &str {
        &self.binding.address
    }

    /// The bound queue.
    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    /// Current counters.
    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether any receive loop is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Stop all receive loops and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Result channel receiver panicked");
            }
        }
        info!(queue = %self.binding.name, "Result channel stopped");
    }
}

struct Consumer {
    worker: usize,
    queue: Arc<dyn ResultQueue>,
    store: Arc<ExecutionStore>,
    binding: QueueBinding,
    stats: Arc<ChannelStats>,
    config: ResultChannelConfig,
}

impl Consumer {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = self.worker, "Receiver started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                received = self.queue.receive(
                    &self.binding,
                    self.config.batch_size,
                    self.config.receive_wait,
                ) => match received {
                    Ok(messages) => {
                        for message in messages {
                            self.handle(message).await;
                        }
                    }
                    Err(e) => {
                        self.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(worker = self.worker, error = %e, "Failed to receive results");
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(self.config.error_backoff) => {}
                        }
                    }
                }
            }
        }

        debug!(worker = self.worker, "Receiver stopped");
    }

    async fn handle(&self, message: QueueMessage) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        match ResultEnvelope::parse(&message.body) {
            Ok(envelope) => {
                let correlation_id = envelope.id.clone();
                match self.store.resolve(&correlation_id, envelope.into_outcome()) {
                    Resolution::Delivered => {
                        self.stats.resolved.fetch_add(1, Ordering::Relaxed);
                    }
                    Resolution::Abandoned | Resolution::Unmatched => {
                        self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(reason) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                let diagnostic = ChannelDiagnostic::MalformedMessage { reason };
                warn!(
                    worker = self.worker,
                    receipt = %message.receipt,
                    diagnostic = %diagnostic,
                    "Dropping malformed result message"
                );
            }
        }

        if let Err(e) = self.queue.acknowledge(&self.binding, &message.receipt).await {
            self.stats.ack_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker = self.worker,
                receipt = %message.receipt,
                error = %e,
                "Failed to acknowledge result message"
            );
        }
    }
}
