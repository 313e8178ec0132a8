// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for nimbus-core integration tests.
//!
//! Provides TestContext wiring a Nimbus runtime to the mock compute service
//! and the in-memory result queue.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use nimbus_core::deployer::MockCompute;
use nimbus_core::result_channel::InMemoryQueue;
use nimbus_core::{Nimbus, Settings};

/// Install a test subscriber once; honours RUST_LOG.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nimbus_core=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Settings tuned for fast tests.
pub fn test_settings() -> Settings {
    Settings::default()
        .with_queue_name("TestResultsQueue")
        .with_invocation_timeout(Duration::from_secs(5))
        .with_receive_wait(Duration::from_millis(50))
}

/// Sums numeric arguments; fails when any argument is the string "fail".
pub fn adder(_function: &str, args: &[Value]) -> Result<Value, String> {
    if args.iter().any(|a| a.as_str() == Some("fail")) {
        return Err("requested failure".to_string());
    }
    Ok(Value::from(args.iter().filter_map(Value::as_i64).sum::<i64>()))
}

/// Runtime plus handles on its fakes.
pub struct TestContext {
    pub nimbus: Nimbus,
    pub compute: Arc<MockCompute>,
    pub queue: Arc<InMemoryQueue>,
}

impl TestContext {
    /// Runtime whose remote side answers with [`adder`].
    pub fn with_adder() -> Self {
        let queue = Arc::new(InMemoryQueue::new());
        let compute = Arc::new(MockCompute::new().with_executor(queue.clone(), adder));
        Self::from_parts(compute, queue, test_settings())
    }

    /// Runtime whose remote side never answers.
    pub fn silent() -> Self {
        let queue = Arc::new(InMemoryQueue::new());
        Self::from_parts(Arc::new(MockCompute::new()), queue, test_settings())
    }

    /// Runtime from explicit parts.
    pub fn from_parts(compute: Arc<MockCompute>, queue: Arc<InMemoryQueue>, settings: Settings) -> Self {
        init_tracing();
        let nimbus = Nimbus::builder()
            .settings(settings)
            .compute(compute.clone())
            .queue(queue.clone())
            .build()
            .expect("valid test runtime");
        Self {
            nimbus,
            compute,
            queue,
        }
    }
}
