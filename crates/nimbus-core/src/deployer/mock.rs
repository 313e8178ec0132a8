// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock compute service for testing.
//!
//! Records deployments and triggers without talking to any remote service.
//! With an executor attached it also plays the remote side: each trigger
//! runs the executor and posts a result envelope onto an
//! [`InMemoryQueue`], the way a deployed function would.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use super::traits::*;
use crate::packager::{DeployableUnit, SourceKind};
use crate::result_channel::{InMemoryQueue, ResultEnvelope};

/// Stand-in for the remote code: `(function_name, args) -> result or error message`.
pub type Executor = Arc<dyn Fn(&str, &[Value]) -> std::result::Result<Value, String> + Send + Sync>;

/// Mock function state.
#[derive(Debug, Clone)]
pub struct MockFunction {
    /// Kind of the unit last uploaded.
    pub kind: SourceKind,
    /// Handler of the unit last uploaded.
    pub handler: String,
    /// Digest of the unit last uploaded.
    pub digest: String,
    /// Number of successful creates.
    pub creates: u32,
    /// Number of successful updates.
    pub updates: u32,
}

/// Mock compute service for testing.
pub struct MockCompute {
    functions: Arc<Mutex<HashMap<String, MockFunction>>>,
    triggers: Arc<Mutex<Vec<TriggerRequest>>>,
    transient_failures: AtomicUsize,
    fail_deploys: AtomicBool,
    reject_triggers: AtomicBool,
    remote: Option<(Arc<InMemoryQueue>, Executor)>,
    /// Simulated remote execution time (in milliseconds).
    pub execution_delay_ms: u64,
}

impl Default for MockCompute {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCompute {
    /// Create a mock that accepts everything and never answers.
    pub fn new() -> Self {
        Self {
            functions: Arc::new(Mutex::new(HashMap::new())),
            triggers: Arc::new(Mutex::new(Vec::new())),
            transient_failures: AtomicUsize::new(0),
            fail_deploys: AtomicBool::new(false),
            reject_triggers: AtomicBool::new(false),
            remote: None,
            execution_delay_ms: 0,
        }
    }

    /// Answer every trigger by running `executor` and posting its result to `queue`.
    pub fn with_executor<F>(mut self, queue: Arc<InMemoryQueue>, executor: F) -> Self
    where
        F: Fn(&str, &[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.remote = Some((queue, Arc::new(executor)));
        self
    }

    /// Delay every simulated remote execution.
    pub fn with_execution_delay(mut self, delay: Duration) -> Self {
        self.execution_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Fail the next `count` create/update calls with a transient error.
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Reject every create/update call.
    pub fn failing_deploys(self) -> Self {
        self.fail_deploys.store(true, Ordering::SeqCst);
        self
    }

    /// Reject (or stop rejecting) triggers.
    pub fn set_reject_triggers(&self, reject: bool) {
        self.reject_triggers.store(reject, Ordering::SeqCst);
    }

    /// State of a deployed function.
    pub async fn function(&self, name: &str) -> Option<MockFunction> {
        self.functions.lock().await.get(name).cloned()
    }

    /// Every accepted trigger, in order.
    pub async fn triggers(&self) -> Vec<TriggerRequest> {
        self.triggers.lock().await.clone()
    }

    fn check_deploy(&self) -> Result<()> {
        if self.fail_deploys.load(Ordering::SeqCst) {
            return Err(ComputeError::Rejected("mock deployment rejected".to_string()));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ComputeError::Transient("mock throttling".to_string()));
        }
        Ok(())
    }

    fn handle_for(unit: &DeployableUnit) -> FunctionHandle {
        FunctionHandle::for_unit(unit, Some(format!("mock:function:{}", unit.function_name)))
    }
}

#[async_trait]
impl ComputeService for MockCompute {
    fn service_type(&self) -> &'static str {
        "mock"
    }

    async fn function_exists(&self, name: &str) -> Result<bool> {
        Ok(self.functions.lock().await.contains_key(name))
    }

    async fn create_function(&self, unit: &DeployableUnit) -> Result<FunctionHandle> {
        self.check_deploy()?;
        let mut functions = self.functions.lock().await;
        if functions.contains_key(&unit.function_name) {
            return Err(ComputeError::AlreadyExists(unit.function_name.clone()));
        }
        functions.insert(
            unit.function_name.clone(),
            MockFunction {
                kind: unit.kind,
                handler: unit.remote_handler(),
                digest: unit.digest.clone(),
                creates: 1,
                updates: 0,
            },
        );
        Ok(Self::handle_for(unit))
    }

    async fn update_function(&self, unit: &DeployableUnit) -> Result<FunctionHandle> {
        self.check_deploy()?;
        let mut functions = self.functions.lock().await;
        let function = functions
            .get_mut(&unit.function_name)
            .ok_or_else(|| ComputeError::NotFound(unit.function_name.clone()))?;
        function.kind = unit.kind;
        function.handler = unit.remote_handler();
        function.digest = unit.digest.clone();
        function.updates += 1;
        Ok(Self::handle_for(unit))
    }

    async fn trigger(&self, handle: &FunctionHandle, request: &TriggerRequest) -> Result<()> {
        if self.reject_triggers.load(Ordering::SeqCst) {
            return Err(ComputeError::Rejected("mock trigger rejected".to_string()));
        }
        if !self.functions.lock().await.contains_key(&handle.name) {
            return Err(ComputeError::NotFound(handle.name.clone()));
        }
        self.triggers.lock().await.push(request.clone());

        if let Some((queue, executor)) = &self.remote {
            let queue = queue.clone();
            let executor = executor.clone();
            let function = handle.name.clone();
            let request = request.clone();
            let delay = Duration::from_millis(self.execution_delay_ms);

            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let envelope = match executor(&function, &request.args) {
                    Ok(value) => ResultEnvelope::success(&request.id, value),
                    Err(message) => ResultEnvelope::error(&request.id, json!({ "message": message })),
                };
                if let Err(e) = queue.send(&request.queue, envelope.to_json()) {
                    warn!(function = %function, error = %e, "Mock remote could not post result");
                }
            });
        }

        Ok(())
    }
}
