// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute service trait definitions.
//!
//! Defines the abstract interface to the remote compute service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::packager::DeployableUnit;

/// Errors from compute service operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ComputeError {
    /// The function does not exist.
    #[error("Function not found: {0}")]
    NotFound(String),

    /// The function already exists (lost a create race).
    #[error("Function already exists: {0}")]
    AlreadyExists(String),

    /// Throttling, 5xx or connection failure; worth retrying.
    #[error("Transient service error: {0}")]
    Transient(String),

    /// The service refused the request.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The unit could not be turned into an upload.
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

impl ComputeError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ComputeError::Transient(_))
    }
}

/// Result type for compute service operations.
pub type Result<T> = std::result::Result<T, ComputeError>;

/// A deployed remote function, reusable across many invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionHandle {
    /// Remote function name.
    pub name: String,
    /// Service-specific identifier (ARN for Lambda).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// Digest of the unit this function was deployed from.
    pub digest: String,
    /// When the create/update was acknowledged.
    pub deployed_at: DateTime<Utc>,
}

impl FunctionHandle {
    /// Create a handle for `unit` acknowledged now.
    pub fn for_unit(unit: &DeployableUnit, remote_id: Option<String>) -> Self {
        Self {
            name: unit.function_name.clone(),
            remote_id,
            digest: unit.digest.clone(),
            deployed_at: Utc::now(),
        }
    }
}

/// Event payload carried by every fire-and-forget trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// Correlation id echoed back in the result envelope.
    pub id: String,
    /// Positional arguments for the remote function.
    pub args: Vec<Value>,
    /// Address of the result queue.
    pub queue: String,
}

/// Trait for remote compute services.
///
/// Services are PURE transport adapters: they do not retry, cache or
/// correlate. The [`Deployer`](super::Deployer) owns those concerns.
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Service type identifier (e.g., "lambda", "mock").
    fn service_type(&self) -> &'static str;

    /// Check whether a function with this name exists.
    async fn function_exists(&self, name: &str) -> Result<bool>;

    /// Create a new function from the unit.
    async fn create_function(&self, unit: &DeployableUnit) -> Result<FunctionHandle>;

    /// Replace code and configuration of an existing function.
    async fn update_function(&self, unit: &DeployableUnit) -> Result<FunctionHandle>;

    /// Trigger an event-style invocation.
    ///
    /// Returns once the service accepted the event; never waits for the
    /// remote result.
    async fn trigger(&self, handle: &FunctionHandle, request: &TriggerRequest) -> Result<()>;
}
