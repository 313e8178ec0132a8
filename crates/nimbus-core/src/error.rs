// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for nimbus-core.
//!
//! Structural and configuration errors are returned synchronously from the
//! call that caused them. Per-invocation outcomes (`InvocationRejected`,
//! `TimedOut`, `RemoteExecution`, `Cancelled`) are only ever delivered through
//! the invocation's own future.

use std::path::PathBuf;

use thiserror::Error;

/// Nimbus errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A dependency or module path could not be resolved.
    #[error(
        "Could not resolve module [{reference}] from [{}] at [{}]",
        base_dir.display(),
        attempted.display()
    )]
    ModuleResolution {
        /// The reference as supplied by the caller.
        reference: String,
        /// Base directory used for the relative attempt.
        base_dir: PathBuf,
        /// The relative location that was probed after the global lookup failed.
        attempted: PathBuf,
    },

    /// The source argument is malformed (not invocable, empty archive, ...).
    #[error("Invalid source: {0}")]
    InvalidSource(String),

    /// Remote create/update failed after the retry budget was spent.
    #[error("Deployment of {function} failed: {reason}")]
    DeploymentFailed {
        /// Remote function name.
        function: String,
        /// Last failure observed.
        reason: String,
    },

    /// The fire-and-forget trigger was not accepted.
    #[error("Invocation of {function} rejected: {reason}")]
    InvocationRejected {
        /// Remote function name.
        function: String,
        /// Rejection reason reported by the compute service.
        reason: String,
    },

    /// A correlation id was registered twice.
    #[error("Correlation id already registered: {0}")]
    CorrelationCollision(String),

    /// No result arrived before the invocation deadline.
    #[error("Invocation {correlation_id} timed out after {timeout_ms}ms")]
    TimedOut {
        /// Correlation id of the invocation.
        correlation_id: String,
        /// Timeout that was applied.
        timeout_ms: u64,
    },

    /// The remote computation itself failed.
    #[error("Remote execution failed: {message}")]
    RemoteExecution {
        /// Error description carried in the result envelope.
        message: String,
        /// Raw envelope payload.
        payload: serde_json::Value,
    },

    /// The invocation was cancelled locally.
    #[error("Invocation {0} cancelled")]
    Cancelled(String),

    /// The completion handle was dropped without an outcome.
    #[error("Result channel closed before invocation {0} settled")]
    ChannelClosed(String),

    /// Result queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] crate::result_channel::QueueError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is a per-invocation outcome rather than a structural failure.
    pub fn is_invocation_outcome(&self) -> bool {
        matches!(
            self,
            Error::InvocationRejected { .. }
                | Error::TimedOut { .. }
                | Error::RemoteExecution { .. }
                | Error::Cancelled(_)
                | Error::ChannelClosed(_)
        )
    }
}

/// Result type using Nimbus Error.
pub type Result<T> = std::result::Result<T, Error>;
