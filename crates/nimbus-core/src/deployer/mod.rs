// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment and triggering.
//!
//! The [`Deployer`] turns a [`DeployableUnit`] into a live remote function
//! (create, or update when it already exists) and fires event-style
//! invocations at it. Transport lives behind the [`ComputeService`] trait.
//!
//! Units are redeployed at most once per process: the deployer remembers
//! the digest of everything it uploaded and skips units whose digest is
//! unchanged.

pub mod mock;
pub mod traits;

pub use mock::MockCompute;
pub use traits::*;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::packager::DeployableUnit;

/// First retry delay for transient deployment failures.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Retry delay ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Deploys units and triggers remote functions.
pub struct Deployer {
    compute: Arc<dyn ComputeService>,
    upload_timeout_ms: AtomicU64,
    deployed: DashMap<String, FunctionHandle>,
    reply_queue: RwLock<String>,
}

impl std::fmt::Debug for Deployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployer")
            .field("service_type", &self.compute.service_type())
            .field("deployed", &self.deployed.len())
            .field("reply_queue", &self.reply_queue())
            .finish()
    }
}

impl Deployer {
    /// Create a deployer over `compute`.
    ///
    /// `reply_queue` is what remote functions are told to post results to
    /// until [`set_reply_queue`](Self::set_reply_queue) supplies the bound
    /// queue address.
    pub fn new(
        compute: Arc<dyn ComputeService>,
        upload_timeout: Duration,
        reply_queue: impl Into<String>,
    ) -> Self {
        Self {
            compute,
            upload_timeout_ms: AtomicU64::new(upload_timeout.as_millis() as u64),
            deployed: DashMap::new(),
            reply_queue: RwLock::new(reply_queue.into()),
        }
    }

    /// The compute service in use.
    pub fn compute(&self) -> &Arc<dyn ComputeService> {
        &self.compute
    }

    /// Bound on each deployment and each trigger.
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms.load(Ordering::Relaxed))
    }

    /// Change the bound used by subsequent deployments and triggers.
    pub fn set_upload_timeout(&self, timeout: Duration) {
        self.upload_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Queue address embedded in trigger requests.
    pub fn reply_queue(&self) -> String {
        self.reply_queue
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Set the queue address embedded in trigger requests.
    pub fn set_reply_queue(&self, address: impl Into<String>) {
        let address = address.into();
        debug!(address = %address, "Reply queue set");
        *self.reply_queue.write().unwrap_or_else(|e| e.into_inner()) = address;
    }

    /// Handle of a function this deployer has deployed, if any.
    pub fn deployed(&self, function_name: &str) -> Option<FunctionHandle> {
        self.deployed.get(function_name).map(|h| h.clone())
    }

    /// Make `unit` live, creating or updating the remote function.
    ///
    /// Transient service failures are retried with backoff until the upload
    /// timeout elapses; anything else fails at once with
    /// [`Error::DeploymentFailed`].
    pub async fn deploy(&self, unit: &DeployableUnit) -> Result<FunctionHandle> {
        if let Some(existing) = self.deployed.get(&unit.function_name)
            && existing.digest == unit.digest
        {
            debug!(
                function = %unit.function_name,
                digest = %unit.digest,
                "Function unchanged, skipping upload"
            );
            return Ok(existing.clone());
        }

        let upload_timeout = self.upload_timeout();
        let last_error: Mutex<Option<String>> = Mutex::new(None);

        let attempt = tokio::time::timeout(upload_timeout, async {
            let mut backoff = INITIAL_BACKOFF;
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                match self.create_or_update(unit).await {
                    Ok(handle) => return Ok(handle),
                    Err(e) if e.is_transient() => {
                        warn!(
                            function = %unit.function_name,
                            attempt = attempts,
                            retry_in_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Transient deployment failure, retrying"
                        );
                        *last_error.lock().unwrap_or_else(|p| p.into_inner()) = Some(e.to_string());
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        let handle = match attempt {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(Error::DeploymentFailed {
                    function: unit.function_name.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                let last = last_error
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .take();
                let reason = match last {
                    Some(last) => format!(
                        "timed out after {}ms (last error: {})",
                        upload_timeout.as_millis(),
                        last
                    ),
                    None => format!("timed out after {}ms", upload_timeout.as_millis()),
                };
                return Err(Error::DeploymentFailed {
                    function: unit.function_name.clone(),
                    reason,
                });
            }
        };

        info!(
            function = %handle.name,
            kind = %unit.kind,
            service_type = self.compute.service_type(),
            digest = %handle.digest,
            "Function deployed"
        );
        self.deployed.insert(handle.name.clone(), handle.clone());
        Ok(handle)
    }

    async fn create_or_update(&self, unit: &DeployableUnit) -> traits::Result<FunctionHandle> {
        if self.compute.function_exists(&unit.function_name).await? {
            debug!(function = %unit.function_name, "Updating existing function");
            return self.compute.update_function(unit).await;
        }

        debug!(function = %unit.function_name, "Creating function");
        match self.compute.create_function(unit).await {
            Err(ComputeError::AlreadyExists(_)) => {
                debug!(function = %unit.function_name, "Lost create race, updating instead");
                self.compute.update_function(unit).await
            }
            other => other,
        }
    }

    /// Fire an event-style invocation carrying `correlation_id` and `args`.
    ///
    /// Returns once the service accepted the event.
    pub async fn invoke(
        &self,
        handle: &FunctionHandle,
        correlation_id: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        let request = TriggerRequest {
            id: correlation_id.to_string(),
            args,
            queue: self.reply_queue(),
        };
        let upload_timeout = self.upload_timeout();

        let rejected = |reason: String| Error::InvocationRejected {
            function: handle.name.clone(),
            reason,
        };

        match tokio::time::timeout(upload_timeout, self.compute.trigger(handle, &request)).await {
            Ok(Ok(())) => {
                debug!(
                    function = %handle.name,
                    correlation_id,
                    "Invocation triggered"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(rejected(e.to_string())),
            Err(_) => Err(rejected(format!(
                "trigger not acknowledged within {}ms",
                upload_timeout.as_millis()
            ))),
        }
    }
}
