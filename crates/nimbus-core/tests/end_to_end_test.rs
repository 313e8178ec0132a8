// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests: create, invoke, and route results back through the queue.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{TestContext, test_settings};
use nimbus_core::deployer::MockCompute;
use nimbus_core::result_channel::{InMemoryQueue, ResultEnvelope};
use nimbus_core::{Error, InlineSource, RunConfig};

const ADD: &str = "function (a, b) { return a + b; }";

#[tokio::test]
async fn test_inline_add_returns_three() {
    let ctx = TestContext::with_adder();
    ctx.nimbus.start().await.unwrap();

    let add = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap();
    let sum = add.call(vec![json!(1), json!(2)]).await.unwrap();

    assert_eq!(sum, json!(3));
    assert!(ctx.nimbus.execution_store().is_empty());

    let triggers = ctx.compute.triggers().await;
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].queue, "memory://TestResultsQueue");

    ctx.nimbus.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_invocations_resolve_out_of_order() {
    let ctx = TestContext::silent();
    ctx.nimbus.start().await.unwrap();
    let proxy = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap();

    let first = proxy.invoke(vec![json!("first")]).await;
    let second = proxy.invoke(vec![json!("second")]).await;
    assert_ne!(first.id(), second.id());

    // Results arrive in reverse order.
    ctx.queue
        .send(
            "TestResultsQueue",
            ResultEnvelope::success(second.id(), json!("B")).to_json(),
        )
        .unwrap();
    ctx.queue
        .send(
            "TestResultsQueue",
            ResultEnvelope::success(first.id(), json!("A")).to_json(),
        )
        .unwrap();

    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap(), json!("A"));
    assert_eq!(b.unwrap(), json!("B"));

    ctx.nimbus.shutdown().await;
}

#[tokio::test]
async fn test_many_parallel_calls() {
    let ctx = TestContext::with_adder();
    ctx.nimbus.start().await.unwrap();
    let add = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap();

    let calls = (0..20).map(|i| {
        let add = add.clone();
        async move { add.call(vec![json!(i), json!(i)]).await }
    });
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(i as i64 * 2));
    }
    assert!(ctx.nimbus.execution_store().is_empty());

    ctx.nimbus.shutdown().await;
}

#[tokio::test]
async fn test_malformed_message_does_not_stop_channel() {
    let ctx = TestContext::silent();
    ctx.nimbus.start().await.unwrap();
    let proxy = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap();

    let invocation = proxy.invoke(vec![]).await;
    ctx.queue.send("TestResultsQueue", "}}garbage{{").unwrap();
    ctx.queue
        .send(
            "TestResultsQueue",
            ResultEnvelope::success(invocation.id(), json!(42)).to_json(),
        )
        .unwrap();

    assert_eq!(invocation.await.unwrap(), json!(42));

    for _ in 0..100 {
        if ctx.nimbus.channel_stats().await.unwrap().malformed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stats = ctx.nimbus.channel_stats().await.unwrap();
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.malformed, 1);

    ctx.nimbus.shutdown().await;
}

#[tokio::test]
async fn test_short_timeout_and_late_result() {
    let ctx = TestContext::silent();
    ctx.nimbus.start().await.unwrap();
    let proxy = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(10));

    let invocation = proxy.invoke(vec![]).await;
    let id = invocation.id().to_string();

    let started = tokio::time::Instant::now();
    match invocation.await {
        Err(Error::TimedOut { timeout_ms, .. }) => assert_eq!(timeout_ms, 10),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    // A result arriving after the timeout is unmatched and changes nothing.
    ctx.queue
        .send(
            "TestResultsQueue",
            ResultEnvelope::success(&id, json!(1)).to_json(),
        )
        .unwrap();
    for _ in 0..100 {
        if ctx.nimbus.channel_stats().await.unwrap().unmatched == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(ctx.nimbus.channel_stats().await.unwrap().unmatched, 1);
    assert!(ctx.nimbus.execution_store().is_empty());

    ctx.nimbus.shutdown().await;
}

#[tokio::test]
async fn test_remote_error_surfaces_message() {
    let ctx = TestContext::with_adder();
    ctx.nimbus.start().await.unwrap();
    let add = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap();

    match add.call(vec![json!("fail")]).await {
        Err(Error::RemoteExecution { message, payload }) => {
            assert_eq!(message, "requested failure");
            assert_eq!(payload["message"], json!("requested failure"));
        }
        other => panic!("expected remote error, got {:?}", other),
    }

    ctx.nimbus.shutdown().await;
}

#[tokio::test]
async fn test_rejected_trigger_settles_immediately() {
    let ctx = TestContext::with_adder();
    ctx.nimbus.start().await.unwrap();
    let add = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap();
    ctx.compute.set_reject_triggers(true);

    assert!(matches!(
        add.call(vec![json!(1)]).await,
        Err(Error::InvocationRejected { .. })
    ));
    assert!(ctx.nimbus.execution_store().is_empty());

    ctx.nimbus.shutdown().await;
}

#[tokio::test]
async fn test_cancel_then_late_result_is_unmatched() {
    let ctx = TestContext::silent();
    ctx.nimbus.start().await.unwrap();
    let proxy = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap();

    let invocation = proxy.invoke(vec![]).await;
    let id = invocation.id().to_string();
    assert!(invocation.cancel());
    assert!(matches!(invocation.await, Err(Error::Cancelled(_))));

    ctx.queue
        .send(
            "TestResultsQueue",
            ResultEnvelope::success(&id, json!(1)).to_json(),
        )
        .unwrap();
    for _ in 0..100 {
        if ctx.nimbus.channel_stats().await.unwrap().unmatched == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(ctx.nimbus.channel_stats().await.unwrap().unmatched, 1);

    ctx.nimbus.shutdown().await;
}

#[tokio::test]
async fn test_redeploy_skips_unchanged_and_updates_changed() {
    let ctx = TestContext::with_adder();

    let first = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap();
    let again = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap();
    assert_eq!(first.handle(), again.handle());

    let recorded = ctx.compute.function(first.function_name()).await.unwrap();
    assert_eq!((recorded.creates, recorded.updates), (1, 0));

    // Same explicit name, different run config: same function, updated.
    let config = RunConfig::default().with_name("adder");
    ctx.nimbus
        .create_inline(InlineSource::new(ADD).with_config(config.clone()))
        .await
        .unwrap();
    ctx.nimbus
        .create_inline(InlineSource::new(ADD).with_config(config.with_memory_mb(256)))
        .await
        .unwrap();

    let recorded = ctx.compute.function("adder").await.unwrap();
    assert_eq!((recorded.creates, recorded.updates), (1, 1));
}

#[tokio::test]
async fn test_transient_deploy_failures_are_retried() {
    let queue = Arc::new(InMemoryQueue::new());
    let compute = Arc::new(MockCompute::new().with_transient_failures(2));
    let ctx = TestContext::from_parts(compute, queue, test_settings());

    let proxy = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap();
    assert!(ctx.compute.function(proxy.function_name()).await.is_some());
}

#[tokio::test]
async fn test_persistent_deploy_failure() {
    let queue = Arc::new(InMemoryQueue::new());
    let compute = Arc::new(MockCompute::new().with_transient_failures(usize::MAX));
    let settings = test_settings().with_upload_timeout(Duration::from_millis(300));
    let ctx = TestContext::from_parts(compute, queue, settings);

    match ctx.nimbus.create_inline(InlineSource::new(ADD)).await {
        Err(Error::DeploymentFailed { reason, .. }) => assert!(reason.contains("timed out")),
        other => panic!("expected deployment failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invocation_without_start_times_out() {
    let ctx = TestContext::silent();
    let proxy = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(20));

    let invocation = proxy.invoke(vec![json!(1), json!(2)]).await;
    assert_eq!(
        ctx.compute.triggers().await[0].queue,
        "TestResultsQueue",
        "unbound channel falls back to the queue name"
    );

    let id = invocation.id().to_string();
    let outcome = tokio::time::timeout(Duration::from_secs(2), invocation)
        .await
        .expect("invocation should settle without start");
    assert!(matches!(outcome, Err(Error::TimedOut { .. })));
    assert!(!ctx.nimbus.execution_store().contains(&id));
    assert!(!ctx.nimbus.is_running().await);
}

#[tokio::test]
async fn test_invocation_after_shutdown_times_out() {
    let ctx = TestContext::silent();
    ctx.nimbus.start().await.unwrap();
    ctx.nimbus.shutdown().await;

    let proxy = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(20));
    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        proxy.call(vec![json!(1), json!(2)]),
    )
    .await
    .expect("invocation should settle after shutdown");
    assert!(matches!(outcome, Err(Error::TimedOut { .. })));
}

#[tokio::test]
async fn test_short_timeout_settles_promptly_with_default_sweep_interval() {
    let settings = test_settings();
    assert_eq!(settings.sweep_interval, nimbus_core::Settings::default().sweep_interval);
    let ctx = TestContext::from_parts(
        Arc::new(MockCompute::new()),
        Arc::new(InMemoryQueue::new()),
        settings,
    );
    ctx.nimbus.start().await.unwrap();

    let proxy = ctx
        .nimbus
        .create_inline(InlineSource::new(ADD))
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(10));
    // Let the sweeper park on its full interval first.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = tokio::time::Instant::now();
    let outcome = proxy.call(vec![json!(1), json!(2)]).await;
    assert!(matches!(outcome, Err(Error::TimedOut { .. })));
    assert!(started.elapsed() < Duration::from_millis(50));

    ctx.nimbus.shutdown().await;
}
