// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AWS Lambda compute service.
//!
//! Functions are created with a zip bundle and the execution role from
//! `NIMBUS_LAMBDA_ROLE_ARN`. Triggers use the `Event` invocation type, so
//! Lambda only acknowledges receipt; results come back through the queue.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_lambda::Client;
use aws_sdk_lambda::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::{
    Environment, FunctionCode, InvocationType, LastUpdateStatus, Runtime, State,
};
use nimbus_core::config::Settings;
use nimbus_core::deployer::traits::Result as ComputeResult;
use nimbus_core::deployer::{ComputeError, ComputeService, FunctionHandle, TriggerRequest};
use nimbus_core::packager::DeployableUnit;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bundle::build_zip;
use crate::error::{describe, is_transient};

/// Environment variable holding the execution role ARN.
pub const ROLE_ARN_VAR: &str = "NIMBUS_LAMBDA_ROLE_ARN";

/// Delay between polls while a function settles after create/update.
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Polls before giving up on a function that stays pending.
const SETTLE_MAX_POLLS: u32 = 60;

/// Lambda-backed [`ComputeService`].
#[derive(Debug, Clone)]
pub struct LambdaCompute {
    client: Client,
    role_arn: String,
}

impl LambdaCompute {
    /// Create a service from loaded SDK configuration.
    pub fn new(config: &SdkConfig, role_arn: impl Into<String>) -> Self {
        Self {
            client: Client::new(config),
            role_arn: role_arn.into(),
        }
    }

    /// Create a service for `settings`, reading the role from the environment.
    pub async fn from_settings(settings: &Settings) -> crate::Result<Self> {
        let role_arn = std::env::var(ROLE_ARN_VAR)
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(crate::Error::MissingEnvVar(ROLE_ARN_VAR))?;
        let config = crate::sdk_config::load(settings).await;
        Ok(Self::new(&config, role_arn))
    }

    /// Execution role attached to created functions.
    pub fn role_arn(&self) -> &str {
        &self.role_arn
    }

    fn environment(unit: &DeployableUnit) -> Environment {
        let variables: HashMap<String, String> = unit
            .config
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Environment::builder().set_variables(Some(variables)).build()
    }

    /// Wait until the function has left the pending / in-progress states.
    ///
    /// Lambda refuses configuration updates while a code update is still
    /// being applied.
    async fn wait_until_settled(&self, name: &str) -> ComputeResult<()> {
        for _ in 0..SETTLE_MAX_POLLS {
            let config = self
                .client
                .get_function_configuration()
                .function_name(name)
                .send()
                .await
                .map_err(|e| classify(e, name))?;

            let pending = matches!(config.state(), Some(State::Pending))
                || matches!(config.last_update_status(), Some(LastUpdateStatus::InProgress));
            if !pending {
                if matches!(config.state(), Some(State::Failed))
                    || matches!(config.last_update_status(), Some(LastUpdateStatus::Failed))
                {
                    return Err(ComputeError::Rejected(format!(
                        "function {} failed to settle: {}",
                        name,
                        config
                            .last_update_status_reason()
                            .or(config.state_reason())
                            .unwrap_or("no reason given")
                    )));
                }
                return Ok(());
            }

            debug!(function = %name, "Waiting for function to settle");
            sleep(SETTLE_POLL_INTERVAL).await;
        }

        Err(ComputeError::Transient(format!(
            "function {} is still updating",
            name
        )))
    }
}

#[async_trait]
impl ComputeService for LambdaCompute {
    fn service_type(&self) -> &'static str {
        "lambda"
    }

    async fn function_exists(&self, name: &str) -> ComputeResult<bool> {
        match self.client.get_function().function_name(name).send().await {
            Ok(_) => Ok(true),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                Ok(false)
            }
            Err(e) => Err(classify(e, name)),
        }
    }

    async fn create_function(&self, unit: &DeployableUnit) -> ComputeResult<FunctionHandle> {
        let name = &unit.function_name;
        let bundle = build_zip(unit)?;
        let size = bundle.len();

        let output = self
            .client
            .create_function()
            .function_name(name)
            .runtime(Runtime::from(unit.config.runtime.as_str()))
            .role(&self.role_arn)
            .handler(unit.remote_handler())
            .code(FunctionCode::builder().zip_file(Blob::new(bundle)).build())
            .timeout(unit.config.timeout_secs as i32)
            .memory_size(unit.config.memory_mb as i32)
            .set_description(unit.config.description.clone())
            .environment(Self::environment(unit))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .is_some_and(|se| se.is_resource_conflict_exception())
                {
                    ComputeError::AlreadyExists(name.clone())
                } else {
                    classify(e, name)
                }
            })?;

        info!(
            function = %name,
            runtime = %unit.config.runtime,
            size,
            "Lambda function created"
        );
        self.wait_until_settled(name).await?;

        Ok(FunctionHandle::for_unit(
            unit,
            output.function_arn().map(str::to_string),
        ))
    }

    async fn update_function(&self, unit: &DeployableUnit) -> ComputeResult<FunctionHandle> {
        let name = &unit.function_name;
        let bundle = build_zip(unit)?;
        let size = bundle.len();

        let output = self
            .client
            .update_function_code()
            .function_name(name)
            .zip_file(Blob::new(bundle))
            .send()
            .await
            .map_err(|e| classify(e, name))?;
        self.wait_until_settled(name).await?;

        self.client
            .update_function_configuration()
            .function_name(name)
            .runtime(Runtime::from(unit.config.runtime.as_str()))
            .role(&self.role_arn)
            .handler(unit.remote_handler())
            .timeout(unit.config.timeout_secs as i32)
            .memory_size(unit.config.memory_mb as i32)
            .set_description(unit.config.description.clone())
            .environment(Self::environment(unit))
            .send()
            .await
            .map_err(|e| classify(e, name))?;
        self.wait_until_settled(name).await?;

        info!(function = %name, size, "Lambda function updated");

        Ok(FunctionHandle::for_unit(
            unit,
            output.function_arn().map(str::to_string),
        ))
    }

    async fn trigger(&self, handle: &FunctionHandle, request: &TriggerRequest) -> ComputeResult<()> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| ComputeError::Other(format!("failed to encode trigger: {}", e)))?;

        let output = self
            .client
            .invoke()
            .function_name(&handle.name)
            .invocation_type(InvocationType::Event)
            .payload(Blob::new(payload))
            .send()
            .await
            .map_err(|e| classify(e, &handle.name))?;

        if let Some(error) = output.function_error() {
            warn!(
                function = %handle.name,
                correlation_id = %request.id,
                error,
                "Lambda reported a function error on trigger"
            );
            return Err(ComputeError::Rejected(format!(
                "function {} reported {}",
                handle.name, error
            )));
        }

        debug!(
            function = %handle.name,
            correlation_id = %request.id,
            status = output.status_code(),
            "Lambda trigger accepted"
        );
        Ok(())
    }
}

/// Map an SDK failure onto the compute error taxonomy.
fn classify<E, R>(err: SdkError<E, R>, name: &str) -> ComputeError
where
    E: std::error::Error + ProvideErrorMetadata + 'static,
    R: std::fmt::Debug + 'static,
{
    if is_transient(&err) {
        return ComputeError::Transient(describe(&err));
    }
    match err.code() {
        Some("ResourceNotFoundException") => ComputeError::NotFound(name.to_string()),
        _ => ComputeError::Rejected(describe(&err)),
    }
}
