// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable nimbus runtime.
//!
//! [`Nimbus`] ties the pieces together: it packages sources, deploys them,
//! hands out [`CloudFunctionProxy`] values and runs the result channel and
//! timeout sweeper in the background.
//!
//! The sweeper runs for the lifetime of the runtime, independent of the
//! result channel: invocations made before [`Nimbus::start`] or after
//! [`Nimbus::shutdown`] still time out.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nimbus_core::{InlineSource, Nimbus, Settings};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let nimbus = Nimbus::builder()
//!         .settings(Settings::from_env()?)
//!         .compute(compute)   // e.g. nimbus_aws::LambdaCompute
//!         .queue(queue)       // e.g. nimbus_aws::SqsResultQueue
//!         .build()?;
//!     nimbus.start().await?;
//!
//!     let add = nimbus
//!         .create_inline(InlineSource::new("function (a, b) { return a + b; }"))
//!         .await?;
//!     let sum = add.call(vec![1.into(), 2.into()]).await?;
//!     assert_eq!(sum, 3);
//!
//!     nimbus.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{ConfigError, Settings};
use crate::deployer::{ComputeService, Deployer, FunctionHandle};
use crate::error::Result;
use crate::execution_store::{ExecutionStore, TimeoutSweeper};
use crate::packager::{ArchiveSource, InlineSource, ModuleSource, Packager, Source};
use crate::proxy::CloudFunctionProxy;
use crate::resolver::DependencyResolver;
use crate::result_channel::{
    ChannelStatsSnapshot, ResultChannel, ResultChannelConfig, ResultQueue, RunningChannel,
};

/// Builder for creating a [`Nimbus`] runtime.
#[derive(Default)]
pub struct NimbusBuilder {
    settings: Settings,
    compute: Option<Arc<dyn ComputeService>>,
    queue: Option<Arc<dyn ResultQueue>>,
    global_paths: Vec<PathBuf>,
    builtins: Vec<String>,
}

impl NimbusBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the runtime settings.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the compute service functions are deployed to (required).
    pub fn compute(mut self, compute: Arc<dyn ComputeService>) -> Self {
        self.compute = Some(compute);
        self
    }

    /// Set the queue results are read from (required).
    pub fn queue(mut self, queue: Arc<dyn ResultQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Add a global dependency search root.
    pub fn global_path(mut self, root: impl Into<PathBuf>) -> Self {
        self.global_paths.push(root.into());
        self
    }

    /// Register a dependency name the remote runtime provides.
    pub fn builtin(mut self, name: impl Into<String>) -> Self {
        self.builtins.push(name.into());
        self
    }

    /// Validate settings and assemble the runtime. Nothing is started.
    pub fn build(self) -> Result<Nimbus> {
        let compute = self
            .compute
            .ok_or_else(|| ConfigError::Invalid("compute service is required".to_string()))?;
        let queue = self
            .queue
            .ok_or_else(|| ConfigError::Invalid("result queue is required".to_string()))?;

        let resolver = self
            .global_paths
            .into_iter()
            .fold(DependencyResolver::new(), |r, root| r.with_global_path(root));
        let resolver = self
            .builtins
            .into_iter()
            .fold(resolver, |r, name| r.with_builtin(name));

        Nimbus::configure(self.settings, compute, queue, resolver)
    }
}

struct SweeperTask {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Remote invocation runtime.
pub struct Nimbus {
    settings: RwLock<Arc<Settings>>,
    packager: Packager,
    deployer: Arc<Deployer>,
    store: Arc<ExecutionStore>,
    queue: Arc<dyn ResultQueue>,
    channel: Mutex<Option<RunningChannel>>,
    /// Whether the deployer's reply queue points at a bound channel.
    channel_bound: StdMutex<bool>,
    sweeper: StdMutex<Option<SweeperTask>>,
}

impl Nimbus {
    /// Create a new builder.
    pub fn builder() -> NimbusBuilder {
        NimbusBuilder::new()
    }

    /// Assemble a runtime from explicit parts.
    pub fn configure(
        settings: Settings,
        compute: Arc<dyn ComputeService>,
        queue: Arc<dyn ResultQueue>,
        resolver: DependencyResolver,
    ) -> Result<Self> {
        settings.validate()?;

        info!(
            region = %settings.region,
            queue = %settings.queue_name,
            compute = compute.service_type(),
            queue_type = queue.queue_type(),
            "Nimbus configured"
        );

        let deployer = Arc::new(Deployer::new(
            compute,
            settings.upload_timeout,
            settings.queue_name.clone(),
        ));

        let nimbus = Self {
            settings: RwLock::new(Arc::new(settings)),
            packager: Packager::new(resolver),
            deployer,
            store: Arc::new(ExecutionStore::new()),
            queue,
            channel: Mutex::new(None),
            channel_bound: StdMutex::new(false),
            sweeper: StdMutex::new(None),
        };
        nimbus.ensure_sweeper();
        Ok(nimbus)
    }

    /// Spawn the timeout sweeper unless it is already running.
    ///
    /// Outside a tokio runtime this is deferred to the next call made from
    /// inside one.
    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No tokio runtime; timeout sweeper deferred");
            return;
        };

        let task = TimeoutSweeper::new(self.store.clone(), self.settings().sweep_interval);
        let shutdown = task.shutdown_handle();
        let handle = runtime.spawn(async move { task.run().await });
        *sweeper = Some(SweeperTask { shutdown, handle });
    }

    /// Current settings.
    pub fn settings(&self) -> Arc<Settings> {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the settings.
    ///
    /// Applies to deployments and proxies created afterwards. A running
    /// result channel keeps its queue until restarted, and the sweeper keeps
    /// its interval.
    pub fn reconfigure(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        self.deployer.set_upload_timeout(settings.upload_timeout);
        {
            let bound = self.channel_bound.lock().unwrap_or_else(|e| e.into_inner());
            if !*bound {
                self.deployer.set_reply_queue(settings.queue_name.clone());
            }
        }

        info!(
            region = %settings.region,
            queue = %settings.queue_name,
            "Nimbus reconfigured"
        );
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(settings);
        Ok(())
    }

    /// The packager (and through it the dependency resolver).
    pub fn packager(&self) -> &Packager {
        &self.packager
    }

    /// The deployer; extensions can deploy and trigger through it directly.
    pub fn deployer(&self) -> &Arc<Deployer> {
        &self.deployer
    }

    /// Pending invocations.
    pub fn execution_store(&self) -> &Arc<ExecutionStore> {
        &self.store
    }

    /// Package and deploy `source`, returning a proxy for it.
    pub async fn create(&self, source: impl Into<Source>) -> Result<CloudFunctionProxy> {
        self.ensure_sweeper();
        let unit = self.packager.package(source.into())?;
        let handle = self.deployer.deploy(&unit).await?;
        Ok(CloudFunctionProxy::new(
            handle,
            self.deployer.clone(),
            self.store.clone(),
            self.settings().invocation_timeout,
        ))
    }

    /// Deploy an inline function expression.
    pub async fn create_inline(&self, source: InlineSource) -> Result<CloudFunctionProxy> {
        self.create(source).await
    }

    /// Deploy a module file.
    pub async fn create_module(&self, source: ModuleSource) -> Result<CloudFunctionProxy> {
        self.create(source).await
    }

    /// Deploy a prebuilt archive.
    pub async fn create_archive(&self, source: ArchiveSource) -> Result<CloudFunctionProxy> {
        self.create(source).await
    }

    /// Proxy for a function deployed earlier, possibly by another process.
    ///
    /// Nothing is uploaded; invocations fail with
    /// [`Error::InvocationRejected`](crate::Error::InvocationRejected) if the
    /// function does not exist.
    pub fn attach(&self, function_name: impl Into<String>) -> CloudFunctionProxy {
        self.ensure_sweeper();
        let name = function_name.into();
        let handle = self
            .deployer
            .deployed(&name)
            .unwrap_or_else(|| FunctionHandle {
                name,
                remote_id: None,
                digest: String::new(),
                deployed_at: Utc::now(),
            });
        CloudFunctionProxy::new(
            handle,
            self.deployer.clone(),
            self.store.clone(),
            self.settings().invocation_timeout,
        )
    }

    /// Start the result channel (and the timeout sweeper, if not running).
    ///
    /// Returns the bound queue address. Calling it again while running
    /// returns the same address without starting anything.
    pub async fn start(&self) -> Result<String> {
        self.ensure_sweeper();
        let mut running = self.channel.lock().await;
        if let Some(channel) = running.as_ref() {
            return Ok(channel.queue_address().to_string());
        }

        let settings = self.settings();
        let channel = ResultChannel::new(
            self.queue.clone(),
            self.store.clone(),
            ResultChannelConfig::from_settings(&settings),
        )
        .start()
        .await?;
        let address = channel.queue_address().to_string();
        {
            let mut bound = self.channel_bound.lock().unwrap_or_else(|e| e.into_inner());
            *bound = true;
            self.deployer.set_reply_queue(address.clone());
        }

        info!(queue_address = %address, "Nimbus started");
        *running = Some(channel);
        Ok(address)
    }

    /// Whether the result channel and the timeout sweeper are running.
    pub async fn is_running(&self) -> bool {
        let sweeping = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished());
        sweeping
            && self
                .channel
                .lock()
                .await
                .as_ref()
                .is_some_and(|c| c.is_running())
    }

    /// Result channel counters, if started.
    pub async fn channel_stats(&self) -> Option<ChannelStatsSnapshot> {
        self.channel.lock().await.as_ref().map(|c| c.stats())
    }

    /// Stop the result channel.
    ///
    /// Pending invocations stay registered and still time out; results
    /// that arrive while stopped are picked up after the next `start`.
    pub async fn shutdown(&self) {
        let Some(channel) = self.channel.lock().await.take() else {
            return;
        };

        info!("Nimbus shutting down...");
        channel.shutdown().await;
        {
            let mut bound = self.channel_bound.lock().unwrap_or_else(|e| e.into_inner());
            *bound = false;
            self.deployer
                .set_reply_queue(self.settings().queue_name.clone());
        }
        info!("Nimbus shutdown complete");
    }
}

impl Drop for Nimbus {
    fn drop(&mut self) {
        if let Some(sweeper) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            sweeper.shutdown.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployer::MockCompute;
    use crate::error::Error;
    use crate::result_channel::InMemoryQueue;
    use std::time::Duration;

    fn nimbus() -> Nimbus {
        Nimbus::builder()
            .compute(Arc::new(MockCompute::new()))
            .queue(Arc::new(InMemoryQueue::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_compute() {
        let result = Nimbus::builder()
            .queue(Arc::new(InMemoryQueue::new()))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        let result = Nimbus::builder()
            .settings(Settings::default().with_receive_concurrency(0))
            .compute(Arc::new(MockCompute::new()))
            .queue(Arc::new(InMemoryQueue::new()))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let nimbus = nimbus();
        let first = nimbus.start().await.unwrap();
        let second = nimbus.start().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(nimbus.deployer().reply_queue(), first);
        assert!(nimbus.is_running().await);

        nimbus.shutdown().await;
        assert!(!nimbus.is_running().await);
        nimbus.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconfigure_applies_to_new_proxies() {
        let nimbus = nimbus();
        nimbus
            .reconfigure(Settings::default().with_invocation_timeout(Duration::from_millis(250)))
            .unwrap();

        let proxy = nimbus
            .create_inline(InlineSource::new("() => 1"))
            .await
            .unwrap();
        assert_eq!(proxy.timeout(), Duration::from_millis(250));
        assert_eq!(nimbus.settings().invocation_timeout, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_sweeper_runs_from_configure() {
        let nimbus = nimbus();
        assert!(nimbus.sweeper.lock().unwrap().is_some());

        let proxy = nimbus
            .create_inline(InlineSource::new("() => 1"))
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(10));
        let outcome = tokio::time::timeout(Duration::from_secs(2), proxy.call(vec![]))
            .await
            .unwrap();
        assert!(matches!(outcome, Err(Error::TimedOut { .. })));
    }

    #[test]
    fn test_sweeper_deferred_outside_runtime() {
        let nimbus = nimbus();
        assert!(nimbus.sweeper.lock().unwrap().is_none());

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let proxy = nimbus
                .create_inline(InlineSource::new("() => 1"))
                .await
                .unwrap()
                .with_timeout(Duration::from_millis(10));
            assert!(nimbus.sweeper.lock().unwrap().is_some());
            assert!(matches!(
                proxy.call(vec![]).await,
                Err(Error::TimedOut { .. })
            ));
        });
    }

    #[tokio::test]
    async fn test_reconfigure_updates_reply_queue_until_started() {
        let nimbus = nimbus();
        nimbus
            .reconfigure(Settings::default().with_queue_name("RenamedQueue"))
            .unwrap();
        assert_eq!(nimbus.deployer().reply_queue(), "RenamedQueue");

        let address = nimbus.start().await.unwrap();
        nimbus
            .reconfigure(Settings::default().with_queue_name("IgnoredWhileRunning"))
            .unwrap();
        assert_eq!(nimbus.deployer().reply_queue(), address);

        nimbus.shutdown().await;
        assert_eq!(nimbus.deployer().reply_queue(), "IgnoredWhileRunning");
    }

    #[tokio::test]
    async fn test_reconfigure_does_not_race_channel_lock() {
        let nimbus = nimbus();
        // Holding the channel lock must not make reconfigure skip the update.
        let guard = nimbus.channel.lock().await;
        nimbus
            .reconfigure(Settings::default().with_queue_name("WhileLocked"))
            .unwrap();
        drop(guard);
        assert_eq!(nimbus.deployer().reply_queue(), "WhileLocked");
    }

    #[tokio::test]
    async fn test_attach_reuses_known_handle() {
        let nimbus = nimbus();
        let created = nimbus
            .create_inline(InlineSource::new("() => 1"))
            .await
            .unwrap();

        let attached = nimbus.attach(created.function_name());
        assert_eq!(attached.handle(), created.handle());

        let foreign = nimbus.attach("deployed-elsewhere");
        assert_eq!(foreign.function_name(), "deployed-elsewhere");
        assert!(foreign.handle().digest.is_empty());
    }
}
