use std::time::Duration;

use anyhow::Result;
use aws_config::{retry::RetryConfig, timeout::TimeoutConfig, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    Client as S3Client,
};
use tracing::debug;

use crate::config::EngineConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;

/// Client for the archive bucket. Every operation is bounded by
/// `storage_timeout`; addressing is path-style so self-hosted endpoints work.
pub async fn build_client(config: &EngineConfig) -> Result<S3Client> {
    let timeouts = TimeoutConfig::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .operation_timeout(config.storage_timeout)
        .build();

    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.aws_region.clone()))
        .timeout_config(timeouts)
        .retry_config(RetryConfig::standard().with_max_attempts(MAX_ATTEMPTS));

    if let Some(endpoint) = config.aws_endpoint_url.as_deref() {
        loader = loader.endpoint_url(endpoint);
    }

    match (&config.aws_access_key_id, &config.aws_secret_access_key) {
        (Some(key_id), Some(secret)) => {
            let static_keys = Credentials::new(key_id, secret, None, None, "pbx-archiver-env");
            loader = loader.credentials_provider(static_keys);
        }
        _ => debug!("no static S3 keys configured, using the default credential chain"),
    }

    let shared = loader.load().await;
    let client_config = S3ConfigBuilder::from(&shared)
        .force_path_style(true)
        .build();
    Ok(S3Client::from_conf(client_config))
}
