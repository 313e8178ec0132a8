// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pending invocation registry.
//!
//! Every invocation registers a completion handle under its correlation id
//! before the remote function is triggered. The entry leaves the store
//! exactly once, through whichever of these happens first:
//!
//! - a result envelope arrives ([`ExecutionStore::resolve`])
//! - the deadline passes ([`ExecutionStore::evict_expired`], driven by the
//!   [`TimeoutSweeper`])
//! - the caller cancels or drops its future
//!
//! Removal is the atomic step: whoever removes the entry completes it, so a
//! late result racing a timeout can never complete a handle twice.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::result_channel::ChannelDiagnostic;

/// What a pending invocation settles with.
pub type Outcome = Result<Value>;

/// Sending half of an invocation's completion.
pub type CompletionHandle = oneshot::Sender<Outcome>;

/// What happened to a result handed to [`ExecutionStore::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The pending entry was completed.
    Delivered,
    /// The entry existed but its caller had already gone away.
    Abandoned,
    /// No entry with that id (late, duplicate or foreign result).
    Unmatched,
}

struct ExecutionEntry {
    completion: CompletionHandle,
    function: String,
    timeout: Duration,
    registered_at: Instant,
    deadline: Instant,
}

/// Deadline used for timeouts too large to represent ("wait forever").
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Concurrent map from correlation id to pending invocation.
#[derive(Default)]
pub struct ExecutionStore {
    entries: DashMap<String, ExecutionEntry>,
    /// When the sweeper plans to wake next, if one is parked.
    scheduled_wake: Mutex<Option<Instant>>,
    /// Signalled when a new entry expires before `scheduled_wake`.
    rescheduled: Notify,
}

impl std::fmt::Debug for ExecutionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStore")
            .field("pending", &self.entries.len())
            .finish()
    }
}

impl ExecutionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending invocation.
    ///
    /// On a duplicate id the existing entry is left untouched, `completion`
    /// is completed with [`Error::CorrelationCollision`] and the same error
    /// is returned.
    pub fn register(
        &self,
        correlation_id: impl Into<String>,
        completion: CompletionHandle,
        timeout: Duration,
        function: &str,
    ) -> Result<()> {
        let correlation_id = correlation_id.into();
        match self.entries.entry(correlation_id.clone()) {
            Entry::Occupied(_) => {
                warn!(correlation_id = %correlation_id, function, "Correlation id already pending");
                let _ = completion.send(Err(Error::CorrelationCollision(correlation_id.clone())));
                Err(Error::CorrelationCollision(correlation_id))
            }
            Entry::Vacant(slot) => {
                let now = Instant::now();
                let deadline = now
                    .checked_add(timeout)
                    .unwrap_or_else(|| now + FAR_FUTURE);
                slot.insert(ExecutionEntry {
                    completion,
                    function: function.to_string(),
                    timeout,
                    registered_at: now,
                    deadline,
                });
                self.wake_sweeper_before(deadline);
                debug!(
                    correlation_id = %correlation_id,
                    function,
                    timeout_ms = timeout.as_millis() as u64,
                    "Invocation pending"
                );
                Ok(())
            }
        }
    }

    /// Complete the entry for `correlation_id` with `outcome` and remove it.
    pub fn resolve(&self, correlation_id: &str, outcome: Outcome) -> Resolution {
        let Some((_, entry)) = self.entries.remove(correlation_id) else {
            let diagnostic = ChannelDiagnostic::UnmatchedResult {
                correlation_id: correlation_id.to_string(),
            };
            warn!(diagnostic = %diagnostic, "Dropping result with no pending invocation");
            return Resolution::Unmatched;
        };

        let succeeded = outcome.is_ok();
        let elapsed_ms = entry.registered_at.elapsed().as_millis() as u64;
        if entry.completion.send(outcome).is_err() {
            debug!(
                correlation_id,
                function = %entry.function,
                "Result arrived after caller went away"
            );
            return Resolution::Abandoned;
        }

        debug!(
            correlation_id,
            function = %entry.function,
            succeeded,
            elapsed_ms,
            "Invocation resolved"
        );
        Resolution::Delivered
    }

    /// Complete the entry with [`Error::Cancelled`]. Returns false if it
    /// was no longer pending.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        match self.entries.remove(correlation_id) {
            Some((id, entry)) => {
                info!(correlation_id = %id, function = %entry.function, "Invocation cancelled");
                let _ = entry.completion.send(Err(Error::Cancelled(id)));
                true
            }
            None => false,
        }
    }

    /// Remove the entry without completing it.
    pub fn discard(&self, correlation_id: &str) -> bool {
        self.entries.remove(correlation_id).is_some()
    }

    /// Complete every entry whose deadline is at or before `now` with
    /// [`Error::TimedOut`]. Returns how many were evicted.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for id in expired {
            // A result may have won the race since the scan.
            let Some((id, entry)) = self.entries.remove_if(&id, |_, e| e.deadline <= now) else {
                continue;
            };
            let timeout_ms = entry.timeout.as_millis() as u64;
            warn!(
                correlation_id = %id,
                function = %entry.function,
                timeout_ms,
                "Invocation timed out"
            );
            let _ = entry.completion.send(Err(Error::TimedOut {
                correlation_id: id,
                timeout_ms,
            }));
            evicted += 1;
        }
        evicted
    }

    fn wake_sweeper_before(&self, deadline: Instant) {
        let scheduled = *self.scheduled_wake.lock().unwrap_or_else(|e| e.into_inner());
        if scheduled.is_some_and(|wake_at| deadline < wake_at) {
            self.rescheduled.notify_one();
        }
    }

    fn set_scheduled_wake(&self, wake_at: Option<Instant>) {
        *self.scheduled_wake.lock().unwrap_or_else(|e| e.into_inner()) = wake_at;
    }

    /// Earliest deadline among pending entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|entry| entry.deadline).min()
    }

    /// Whether `correlation_id` is pending.
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }

    /// Number of pending invocations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Background worker that fails invocations whose deadline has passed.
pub struct TimeoutSweeper {
    store: Arc<ExecutionStore>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl TimeoutSweeper {
    /// Create a sweeper that wakes at least every `interval`.
    pub fn new(store: Arc<ExecutionStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    ///
    /// Sleeps until the earliest pending deadline, capped at the interval,
    /// so short timeouts fire close to on time.
    pub async fn run(&self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Timeout sweeper started"
        );

        loop {
            let now = Instant::now();
            let latest = now
                .checked_add(self.interval)
                .unwrap_or_else(|| now + FAR_FUTURE);
            // Publish the upper bound first so a register racing the scan
            // below still signals.
            self.store.set_scheduled_wake(Some(latest));
            let wake_at = match self.store.next_deadline() {
                Some(deadline) => deadline.min(latest),
                None => latest,
            };
            self.store.set_scheduled_wake(Some(wake_at));

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Timeout sweeper received shutdown signal");
                    break;
                }

                // An earlier deadline was registered while parked.
                _ = self.store.rescheduled.notified() => {}

                _ = tokio::time::sleep_until(wake_at) => {
                    let evicted = self.store.evict_expired(Instant::now());
                    if evicted > 0 {
                        debug!(evicted, remaining = self.store.len(), "Swept expired invocations");
                    }
                }
            }
        }

        self.store.set_scheduled_wake(None);
        info!("Timeout sweeper stopped");
    }
}
