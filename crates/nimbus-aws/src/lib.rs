// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nimbus AWS - Lambda and SQS Backends
//!
//! Implements the `nimbus-core` backend seams against AWS:
//!
//! | Seam | Implementation | Service calls |
//! |------|----------------|---------------|
//! | `ComputeService` | [`LambdaCompute`] | GetFunction, CreateFunction, UpdateFunctionCode, UpdateFunctionConfiguration, Invoke (Event) |
//! | `ResultQueue` | [`SqsResultQueue`] | GetQueueUrl, CreateQueue, ReceiveMessage, DeleteMessage |
//!
//! Inline and module units are shipped as zip bundles built by [`bundle`];
//! archive units are uploaded as given.
//!
//! # Configuration
//!
//! | Variable | Required | Description |
//! |----------|----------|-------------|
//! | `NIMBUS_LAMBDA_ROLE_ARN` | Yes | Execution role for created functions |
//! | `NIMBUS_ENDPOINT_URL` | No | Endpoint override (e.g. LocalStack) |
//!
//! Region and credentials come from `nimbus_core::Settings`.

#![deny(missing_docs)]

/// Zip bundling of deployable units.
pub mod bundle;

/// Error types for backend setup.
pub mod error;

/// Lambda compute service.
pub mod lambda;

/// Shared SDK configuration loading.
pub mod sdk_config;

/// SQS result queue.
pub mod sqs;

pub use error::{Error, Result};
pub use lambda::LambdaCompute;
pub use sqs::SqsResultQueue;
