// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local stand-ins for deployed functions.
//!
//! A [`CloudFunctionProxy`] is what callers hold after deployment. Each
//! call to [`invoke`](CloudFunctionProxy::invoke) registers a pending entry,
//! fires the remote function and hands back an [`Invocation`], a future
//! that settles when the result envelope arrives, the deadline passes, or
//! the call is cancelled.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::deployer::{Deployer, FunctionHandle};
use crate::error::{Error, Result};
use crate::execution_store::{ExecutionStore, Outcome};

/// Callable handle to a deployed remote function.
///
/// Cheap to clone; clones share the deployment and the pending-invocation
/// store, so any number of concurrent invocations may be in flight.
#[derive(Clone)]
pub struct CloudFunctionProxy {
    handle: FunctionHandle,
    deployer: Arc<Deployer>,
    store: Arc<ExecutionStore>,
    timeout: Duration,
}

impl std::fmt::Debug for CloudFunctionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudFunctionProxy")
            .field("function", &self.handle.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CloudFunctionProxy {
    /// Wrap a deployed function.
    pub fn new(
        handle: FunctionHandle,
        deployer: Arc<Deployer>,
        store: Arc<ExecutionStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            handle,
            deployer,
            store,
            timeout,
        }
    }

    /// Override the per-invocation timeout for this proxy.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The deployed function.
    pub fn handle(&self) -> &FunctionHandle {
        &self.handle
    }

    /// Remote function name.
    pub fn function_name(&self) -> &str {
        &self.handle.name
    }

    /// Per-invocation timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start a remote invocation with positional `args`.
    ///
    /// Resolves once the trigger has been accepted (or refused); the
    /// returned [`Invocation`] then resolves with the remote outcome. A
    /// refused trigger settles the invocation with
    /// [`Error::InvocationRejected`] instead of failing this call.
    pub async fn invoke(&self, args: Vec<Value>) -> Invocation {
        let correlation_id = Uuid::new_v4().to_string();
        let (completion, receiver) = oneshot::channel();
        let invocation = Invocation {
            correlation_id: correlation_id.clone(),
            receiver,
            store: self.store.clone(),
            settled: false,
        };

        if self
            .store
            .register(&correlation_id, completion, self.timeout, &self.handle.name)
            .is_err()
        {
            // The collision error is already waiting in the invocation.
            return invocation;
        }

        if let Err(e) = self.deployer.invoke(&self.handle, &correlation_id, args).await {
            warn!(
                function = %self.handle.name,
                correlation_id = %correlation_id,
                error = %e,
                "Invocation rejected"
            );
            self.store.resolve(&correlation_id, Err(e));
        }

        invocation
    }

    /// Invoke and wait for the outcome.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.invoke(args).await.await
    }
}

/// A pending remote invocation.
///
/// Dropping it before it settles withdraws the pending entry; a result
/// that arrives afterwards is reported as unmatched.
#[must_use = "an invocation does nothing unless awaited"]
pub struct Invocation {
    correlation_id: String,
    receiver: oneshot::Receiver<Outcome>,
    store: Arc<ExecutionStore>,
    settled: bool,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("correlation_id", &self.correlation_id)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Invocation {
    /// Correlation id carried to the remote function and back.
    pub fn id(&self) -> &str {
        &self.correlation_id
    }

    /// Settle the invocation with [`Error::Cancelled`].
    ///
    /// Returns false if it had already been resolved, timed out or cancelled.
    pub fn cancel(&self) -> bool {
        self.store.cancel(&self.correlation_id)
    }
}

impl Future for Invocation {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                this.settled = true;
                Poll::Ready(outcome)
            }
            Poll::Ready(Err(_)) => {
                this.settled = true;
                Poll::Ready(Err(Error::ChannelClosed(this.correlation_id.clone())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if !self.settled && self.store.discard(&self.correlation_id) {
            debug!(correlation_id = %self.correlation_id, "Invocation dropped while pending");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployer::MockCompute;
    use crate::packager::{InlineSource, Packager};
    use crate::resolver::DependencyResolver;

    async fn proxy(compute: Arc<MockCompute>) -> CloudFunctionProxy {
        let unit = Packager::new(DependencyResolver::new())
            .from_inline(InlineSource::new("() => 1"))
            .unwrap();
        let deployer = Arc::new(Deployer::new(compute, Duration::from_secs(5), "results"));
        let handle = deployer.deploy(&unit).await.unwrap();
        CloudFunctionProxy::new(
            handle,
            deployer,
            Arc::new(ExecutionStore::new()),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_invoke_registers_pending() {
        let proxy = proxy(Arc::new(MockCompute::new())).await;
        let invocation = proxy.invoke(vec![]).await;

        assert!(proxy.store.contains(invocation.id()));
        assert!(Uuid::parse_str(invocation.id()).is_ok());
    }

    #[tokio::test]
    async fn test_rejected_trigger_settles_invocation() {
        let compute = Arc::new(MockCompute::new());
        let proxy = proxy(compute.clone()).await;
        compute.set_reject_triggers(true);

        let outcome = proxy.invoke(vec![]).await.await;
        assert!(matches!(outcome, Err(Error::InvocationRejected { .. })));
        assert!(proxy.store.is_empty());
    }

    #[tokio::test]
    async fn test_cancel() {
        let proxy = proxy(Arc::new(MockCompute::new())).await;
        let invocation = proxy.invoke(vec![]).await;

        assert!(invocation.cancel());
        assert!(matches!(invocation.await, Err(Error::Cancelled(_))));
        assert!(proxy.store.is_empty());
    }

    #[tokio::test]
    async fn test_drop_discards_pending() {
        let proxy = proxy(Arc::new(MockCompute::new())).await;
        let invocation = proxy.invoke(vec![]).await;
        let id = invocation.id().to_string();

        drop(invocation);
        assert!(!proxy.store.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout() {
        let proxy = proxy(Arc::new(MockCompute::new()))
            .await
            .with_timeout(Duration::from_millis(10));
        let invocation = proxy.invoke(vec![]).await;

        tokio::time::advance(Duration::from_millis(10)).await;
        proxy.store.evict_expired(tokio::time::Instant::now());

        assert!(matches!(
            invocation.await,
            Err(Error::TimedOut { timeout_ms: 10, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_is_accepted() {
        let proxy = proxy(Arc::new(MockCompute::new()))
            .await
            .with_timeout(Duration::MAX);
        let invocation = proxy.invoke(vec![]).await;
        assert!(proxy.store.contains(invocation.id()));

        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert_eq!(proxy.store.evict_expired(tokio::time::Instant::now()), 0);

        assert!(invocation.cancel());
        assert!(matches!(invocation.await, Err(Error::Cancelled(_))));
    }
}
