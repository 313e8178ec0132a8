// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared SDK configuration.
//!
//! Region and credentials come from [`Settings`]; an optional endpoint
//! override (for LocalStack and similar) comes from `NIMBUS_ENDPOINT_URL`.

use aws_config::{BehaviorVersion, Region, SdkConfig};
use nimbus_core::config::{Credentials, Settings};
use tracing::debug;

/// Environment variable holding an endpoint override.
pub const ENDPOINT_URL_VAR: &str = "NIMBUS_ENDPOINT_URL";

/// Provider name attached to static credentials.
const PROVIDER_NAME: &str = "nimbus";

/// Load SDK configuration for `settings`, honouring `NIMBUS_ENDPOINT_URL`.
pub async fn load(settings: &Settings) -> SdkConfig {
    let endpoint_url = std::env::var(ENDPOINT_URL_VAR)
        .ok()
        .filter(|s| !s.is_empty());
    load_with_endpoint(settings, endpoint_url).await
}

/// Load SDK configuration for `settings` with an explicit endpoint override.
pub async fn load_with_endpoint(settings: &Settings, endpoint_url: Option<String>) -> SdkConfig {
    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(settings.region.clone()));

    if let Some(url) = endpoint_url {
        debug!(endpoint_url = %url, "Using endpoint override");
        loader = loader.endpoint_url(url);
    }

    match &settings.credentials {
        Some(Credentials::Profile(profile)) => {
            debug!(profile = %profile, "Using named credentials profile");
            loader = loader.profile_name(profile);
        }
        Some(Credentials::Keys {
            access_key,
            secret_key,
        }) => {
            debug!("Using static credentials");
            loader = loader.credentials_provider(aws_sdk_sqs::config::Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                PROVIDER_NAME,
            ));
        }
        None => {}
    }

    loader.load().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_region_endpoint_and_keys() {
        let settings = Settings::new()
            .with_region("eu-central-1")
            .with_keys("AKIDEXAMPLE", "secret");
        let config =
            load_with_endpoint(&settings, Some("http://localhost:4566".to_string())).await;

        assert_eq!(
            config.region().map(|r| r.as_ref()),
            Some("eu-central-1")
        );
        assert_eq!(config.endpoint_url(), Some("http://localhost:4566"));
        assert!(config.credentials_provider().is_some());
    }

    #[tokio::test]
    async fn test_no_endpoint_override() {
        let settings = Settings::new().with_keys("AKIDEXAMPLE", "secret");
        let config = load_with_endpoint(&settings, None).await;

        assert_eq!(config.region().map(|r| r.as_ref()), Some("us-west-2"));
        assert!(config.endpoint_url().is_none());
    }
}
