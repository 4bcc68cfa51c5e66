use std::sync::Arc;

use anyhow::{Context, Result};
use diesel::pg::PgConnection;
use tokio::task;
use tracing::info;

use crate::{
    config::EngineConfig,
    db::{PgPool, PgPooledConnection},
    error::SyncResult,
    s3,
    storage::{S3Storage, StorageBackend, StorageRegistry, SupabaseStorage},
};

/// Shared by every tenant cycle; cheap to clone.
#[derive(Clone)]
pub struct EngineState {
    pub pool: PgPool,
    pub config: Arc<EngineConfig>,
    pub storage: StorageRegistry,
}

impl EngineState {
    pub fn new(pool: PgPool, config: EngineConfig, storage: StorageRegistry) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            storage,
        }
    }

    pub fn db(&self) -> SyncResult<PgPooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Runs blocking diesel work on a pooled connection off the async runtime.
    pub async fn with_db<F, T>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&mut PgConnection) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

/// Builds a registry with every backend the configuration names.
pub async fn build_storage(config: &EngineConfig) -> Result<StorageRegistry> {
    let mut registry = StorageRegistry::new();

    if let Some(bucket) = &config.s3_bucket {
        let client = s3::build_client(config).await?;
        registry = registry.with_backend(StorageBackend::S3, Arc::new(S3Storage::new(client, bucket)));
    }

    if let (Some(url), Some(bucket)) = (&config.supabase_url, &config.supabase_bucket) {
        let key = config
            .supabase_service_key
            .as_deref()
            .context("SUPABASE_SERVICE_KEY must be set with SUPABASE_URL")?;
        registry = registry.with_backend(
            StorageBackend::Supabase,
            Arc::new(SupabaseStorage::new(url, key, bucket.clone(), config.storage_timeout)?),
        );
    }

    info!(backends = ?registry.configured(), "storage backends configured");
    Ok(registry)
}
