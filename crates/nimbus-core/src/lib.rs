// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Nimbus Core - Remote Function Invocation
//!
//! This crate turns local code into remote serverless functions and makes
//! calling them look like an ordinary async call. Invocations are
//! fire-and-forget on the wire: the remote function posts its result onto a
//! shared queue, and a background consumer routes each result back to the
//! caller that is waiting for it by correlation id.
//!
//! # Architecture
//!
//! ```text
//!   caller ──► CloudFunctionProxy::invoke
//!                 │  1. register(id) ─────────────►┌────────────────┐
//!                 │                                │ ExecutionStore │◄── TimeoutSweeper
//!                 │  2. Deployer::invoke(id,args)  └───────▲────────┘
//!                 ▼                                        │ resolve(id)
//!         ┌────────────────┐  event   ┌──────────┐         │
//!         │ ComputeService │────────► │  remote  │  ┌──────┴────────┐
//!         │ (Lambda, mock) │          │ function │  │ ResultChannel │
//!         └────────────────┘          └────┬─────┘  └──────▲────────┘
//!                                          │ envelope      │ receive/ack
//!                                          ▼               │
//!                                   ┌──────────────────────┴──┐
//!                                   │ ResultQueue (SQS, memory)│
//!                                   └─────────────────────────┘
//! ```
//!
//! # Source Shapes
//!
//! | Shape | Description |
//! |-------|-------------|
//! | Inline | A function expression plus dependency references |
//! | Module | A module file plus handler name, dependencies and run config |
//! | Archive | A prebuilt zip archive, shipped as-is |
//!
//! # Invocation States
//!
//! ```text
//!                 ┌─────────┐
//!                 │ PENDING │
//!                 └────┬────┘
//!      ┌──────────┬────┴─────┬───────────┐
//!   success     error     deadline     cancel
//!      ▼          ▼          ▼           ▼
//! ┌──────────┐┌────────┐┌───────────┐┌───────────┐
//! │ RESOLVED ││ FAILED ││ TIMED_OUT ││ CANCELLED │
//! └──────────┘└────────┘└───────────┘└───────────┘
//! ```
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `NIMBUS_REGION` / `AWS_REGION` | `us-west-2` | Service region |
//! | `NIMBUS_PROFILE` | - | Named credentials profile |
//! | `NIMBUS_ACCESS_KEY_ID` / `NIMBUS_SECRET_ACCESS_KEY` | - | Static credentials |
//! | `NIMBUS_QUEUE_NAME` | `LambdaResultsQueue` | Result queue name |
//! | `NIMBUS_UPLOAD_TIMEOUT_MS` | `5000` | Deploy and trigger bound |
//! | `NIMBUS_INVOCATION_TIMEOUT_MS` | `60000` | Per-invocation deadline |
//! | `NIMBUS_RECEIVE_CONCURRENCY` | `2` | Concurrent receive loops |
//!
//! # Modules
//!
//! - [`config`]: Settings and credentials
//! - [`error`]: Error types
//! - [`resolver`]: Dependency reference resolution
//! - [`packager`]: Source shapes and deployable units
//! - [`deployer`]: Deployment, triggering and the compute service seam
//! - [`execution_store`]: Pending invocations and the timeout sweeper
//! - [`result_channel`]: Queue consumption and the result queue seam
//! - [`proxy`]: Callable proxies and invocation futures
//! - [`runtime`]: The [`Nimbus`] facade

#![deny(missing_docs)]

/// Settings and credentials.
pub mod config;

/// Error types for nimbus operations.
pub mod error;

/// Dependency reference resolution.
pub mod resolver;

/// Source shapes and deployable units.
pub mod packager;

/// Deployment, triggering and the compute service seam.
pub mod deployer;

/// Pending invocations and the timeout sweeper.
pub mod execution_store;

/// Result queue consumption.
pub mod result_channel;

/// Callable proxies for deployed functions.
pub mod proxy;

/// Embeddable runtime.
pub mod runtime;

pub use config::{Credentials, Settings};
pub use deployer::{ComputeService, Deployer, FunctionHandle};
pub use error::{Error, Result};
pub use packager::{ArchiveSource, InlineSource, ModuleSource, RunConfig, Source};
pub use proxy::{CloudFunctionProxy, Invocation};
pub use result_channel::{ResultEnvelope, ResultQueue};
pub use runtime::Nimbus;
