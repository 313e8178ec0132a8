// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for nimbus.
//!
//! [`Settings`] is built once and handed to the components that need it at
//! construction time. Reconfiguring means building a new `Settings` and
//! passing it to [`Nimbus::reconfigure`](crate::runtime::Nimbus::reconfigure).

use std::time::Duration;

/// Default region when none is configured.
pub const DEFAULT_REGION: &str = "us-west-2";

/// Default name of the result queue.
pub const DEFAULT_QUEUE_NAME: &str = "LambdaResultsQueue";

/// Credentials used by the backends.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Named profile from the shared credentials file.
    Profile(String),
    /// Explicit key pair.
    Keys {
        /// Access key id.
        access_key: String,
        /// Secret access key.
        secret_key: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Profile(name) => f.debug_tuple("Profile").field(name).finish(),
            Credentials::Keys { access_key, .. } => f
                .debug_struct("Keys")
                .field("access_key", access_key)
                .field("secret_key", &"<redacted>")
                .finish(),
        }
    }
}

/// Process-wide settings, read-only once handed to the runtime.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Credentials reference. `None` uses the backend's default provider chain.
    pub credentials: Option<Credentials>,
    /// Region of the compute and queue services.
    pub region: String,
    /// Name of the shared result queue.
    pub queue_name: String,
    /// Budget for creating/updating a remote function, retries included.
    pub upload_timeout: Duration,
    /// Default deadline for a single invocation.
    pub invocation_timeout: Duration,
    /// How often the timeout sweeper runs.
    pub sweep_interval: Duration,
    /// Number of concurrent receive loops on the result queue.
    pub receive_concurrency: usize,
    /// Maximum messages fetched per receive call.
    pub receive_batch_size: usize,
    /// Long-poll wait per receive call.
    pub receive_wait: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            credentials: None,
            region: DEFAULT_REGION.to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            upload_timeout: Duration::from_millis(5000),
            invocation_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(100),
            receive_concurrency: 2,
            receive_batch_size: 10,
            receive_wait: Duration::from_secs(20),
        }
    }
}

impl Settings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from environment variables.
    ///
    /// Environment variables:
    /// - `NIMBUS_REGION` (fallback `AWS_REGION`): region (default: "us-west-2")
    /// - `NIMBUS_PROFILE`: named credentials profile
    /// - `NIMBUS_ACCESS_KEY_ID` / `NIMBUS_SECRET_ACCESS_KEY`: explicit key pair
    /// - `NIMBUS_QUEUE_NAME`: result queue name (default: "LambdaResultsQueue")
    /// - `NIMBUS_UPLOAD_TIMEOUT_MS`: upload timeout (default: 5000)
    /// - `NIMBUS_INVOCATION_TIMEOUT_MS`: invocation timeout (default: 60000)
    /// - `NIMBUS_RECEIVE_CONCURRENCY`: receive loops (default: 2)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let region = std::env::var("NIMBUS_REGION")
            .or_else(|_| std::env::var("AWS_REGION"))
            .unwrap_or_else(|_| DEFAULT_REGION.to_string());

        let credentials = match (
            std::env::var("NIMBUS_PROFILE").ok(),
            std::env::var("NIMBUS_ACCESS_KEY_ID").ok(),
            std::env::var("NIMBUS_SECRET_ACCESS_KEY").ok(),
        ) {
            (_, Some(access_key), Some(secret_key)) => Some(Credentials::Keys {
                access_key,
                secret_key,
            }),
            (_, Some(_), None) => {
                return Err(ConfigError::MissingEnvVar("NIMBUS_SECRET_ACCESS_KEY"));
            }
            (Some(profile), None, _) => Some(Credentials::Profile(profile)),
            (None, None, _) => None,
        };

        let queue_name = std::env::var("NIMBUS_QUEUE_NAME")
            .unwrap_or_else(|_| DEFAULT_QUEUE_NAME.to_string());

        let upload_timeout = Duration::from_millis(parse_var(
            "NIMBUS_UPLOAD_TIMEOUT_MS",
            defaults.upload_timeout.as_millis() as u64,
        )?);
        let invocation_timeout = Duration::from_millis(parse_var(
            "NIMBUS_INVOCATION_TIMEOUT_MS",
            defaults.invocation_timeout.as_millis() as u64,
        )?);
        let receive_concurrency =
            parse_var("NIMBUS_RECEIVE_CONCURRENCY", defaults.receive_concurrency as u64)? as usize;

        let settings = Self {
            credentials,
            region,
            queue_name,
            upload_timeout,
            invocation_timeout,
            receive_concurrency,
            ..defaults
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check invariants that the components rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region.trim().is_empty() {
            return Err(ConfigError::Invalid("region must not be empty".into()));
        }
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::Invalid("queue_name must not be empty".into()));
        }
        if self.receive_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "receive_concurrency must be at least 1".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sweep_interval must be greater than zero".into(),
            ));
        }
        if self.receive_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "receive_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Set the region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Use a named credentials profile.
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::Profile(profile.into()));
        self
    }

    /// Use an explicit key pair.
    pub fn with_keys(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials::Keys {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        });
        self
    }

    /// Set the result queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Set the upload timeout.
    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    /// Set the default invocation timeout.
    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    /// Set the timeout sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the number of concurrent receive loops.
    pub fn with_receive_concurrency(mut self, loops: usize) -> Self {
        self.receive_concurrency = loops;
        self
    }

    /// Set the long-poll wait per receive call.
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }
}

fn parse_var(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable does not hold a valid number.
    #[error("Invalid number in environment variable: {0}")]
    InvalidNumber(&'static str),
    /// A setting violates an invariant.
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.region, "us-west-2");
        assert_eq!(settings.queue_name, "LambdaResultsQueue");
        assert_eq!(settings.upload_timeout, Duration::from_millis(5000));
        assert!(settings.credentials.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let settings = Settings::new()
            .with_region("eu-central-1")
            .with_profile("staging")
            .with_queue_name("results")
            .with_upload_timeout(Duration::from_secs(10))
            .with_invocation_timeout(Duration::from_secs(5))
            .with_receive_concurrency(4);

        assert_eq!(settings.region, "eu-central-1");
        assert_eq!(
            settings.credentials,
            Some(Credentials::Profile("staging".to_string()))
        );
        assert_eq!(settings.queue_name, "results");
        assert_eq!(settings.upload_timeout, Duration::from_secs(10));
        assert_eq!(settings.invocation_timeout, Duration::from_secs(5));
        assert_eq!(settings.receive_concurrency, 4);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let settings = Settings::new().with_receive_concurrency(0);
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_sweep_interval() {
        let settings = Settings::default().with_sweep_interval(Duration::ZERO);
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let settings = Settings::new().with_keys("AKIA123", "very-secret");
        let rendered = format!("{:?}", settings);
        assert!(rendered.contains("AKIA123"));
        assert!(!rendered.contains("very-secret"));
    }
}
