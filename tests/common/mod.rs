#![allow(dead_code)]

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::MigrationHarness;
use once_cell::sync::Lazy;
use pbx_archiver::compression::{MediaCategory, TranscodeError, Transcoded, Transcoder};
use pbx_archiver::config::{
    CompressionSettings, EngineConfig, SyncSettings, TunnelSettings,
};
use pbx_archiver::db::{self, PgPool, MIGRATIONS};
use pbx_archiver::ledger;
use pbx_archiver::models::{MediaFile, NewMediaFile, NewTenant};
use pbx_archiver::schema::{media_files, tenants};
use pbx_archiver::state::EngineState;
use pbx_archiver::storage::{ObjectStorage, StorageBackend, StorageRegistry, StoredObject};
use tempfile::TempDir;
use tokio::sync::Mutex;
use uuid::Uuid;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Clone)]
pub struct FakeObject {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, FakeObject>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.insert(key.to_string(), FakeObject { bytes, content_type });
        Ok(())
    }

    async fn presign_get_object(&self, key: &str, expires_in: Duration) -> Result<String> {
        let guard = self.objects.lock().await;
        ensure!(guard.contains_key(key), "object {key} missing");
        Ok(format!(
            "https://fake-storage/{key}?expires_in={}",
            expires_in.as_secs()
        ))
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let guard = self.objects.lock().await;
        guard
            .get(key)
            .map(|obj| obj.bytes.clone())
            .ok_or_else(|| anyhow!("object {key} missing"))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.remove(key);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let guard = self.objects.lock().await;
        let mut objects: Vec<StoredObject> = guard
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, obj)| StoredObject {
                key: key.clone(),
                size: obj.bytes.len() as i64,
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

impl FakeStorage {
    pub async fn get(&self, key: &str) -> Option<FakeObject> {
        let guard = self.objects.lock().await;
        guard.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        let guard = self.objects.lock().await;
        let mut keys: Vec<String> = guard.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Shrinks every input to a fixed share of its size without decoding it.
pub struct FixedRatioTranscoder {
    pub percent: usize,
}

#[async_trait]
impl Transcoder for FixedRatioTranscoder {
    async fn transcode(
        &self,
        category: MediaCategory,
        bytes: Vec<u8>,
    ) -> Result<Transcoded, TranscodeError> {
        let (mime_type, extension) = match category {
            MediaCategory::Image => ("image/jpeg", "jpg"),
            MediaCategory::Video => ("video/mp4", "mp4"),
            MediaCategory::Other => return Err(TranscodeError::Unsupported(category.as_str())),
        };
        let size = bytes.len() * self.percent / 100;
        Ok(Transcoded {
            bytes: vec![0x5a; size],
            mime_type: mime_type.into(),
            extension,
        })
    }
}

pub struct TestContext {
    pub state: EngineState,
    storage: Arc<FakeStorage>,
    backup_dir: TempDir,
}

impl TestContext {
    /// `None` when `TEST_DATABASE_URL` is unset; callers return early.
    pub async fn new() -> Result<Option<Self>> {
        let Ok(database_url) = env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set; skipping database flow");
            return Ok(None);
        };

        let backup_dir = tempfile::tempdir().context("failed to create backup dir")?;
        let config = EngineConfig {
            database_url: database_url.clone(),
            database_max_pool_size: db::DEFAULT_MAX_POOL_SIZE,
            sync: SyncSettings::default(),
            tunnel: TunnelSettings::default(),
            linker_recent_window: 500,
            aws_endpoint_url: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_region: "us-east-1".to_string(),
            s3_bucket: Some("test-bucket".to_string()),
            supabase_url: None,
            supabase_service_key: None,
            supabase_bucket: None,
            storage_timeout: Duration::from_secs(30),
            compression: CompressionSettings {
                image_min_bytes: 1024,
                video_min_bytes: 1024,
                ..CompressionSettings::default()
            },
            backup_dir: backup_dir.path().to_path_buf(),
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let registry = StorageRegistry::new().with_backend(StorageBackend::S3, storage.clone());
        let state = EngineState::new(pool, config, registry);

        Ok(Some(Self {
            state,
            storage,
            backup_dir,
        }))
    }

    pub fn storage(&self) -> Arc<FakeStorage> {
        self.storage.clone()
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir.path().to_path_buf()
    }

    pub async fn insert_tenant(&self, name: &str) -> Result<Uuid> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let tenant = NewTenant {
                id: Uuid::new_v4(),
                name,
                ssh_host: "pbx.invalid".into(),
                ssh_port: 22,
                ssh_user: "backup".into(),
                ssh_password: Some("secret".into()),
                ssh_private_key: None,
                db_host: "127.0.0.1".into(),
                db_port: 5432,
                db_name: "pbx".into(),
                db_user: "pbx".into(),
                db_password: "pbx".into(),
                sync_enabled: true,
                default_storage_backend: "s3".into(),
            };
            diesel::insert_into(tenants::table)
                .values(&tenant)
                .execute(conn)
                .context("failed to insert tenant")?;
            Ok(tenant.id)
        })
        .await
    }

    /// Stores `bytes` in the fake backend and records an unlinked MediaFile for it.
    pub async fn insert_media(
        &self,
        tenant_id: Uuid,
        storage_path: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<MediaFile> {
        let size = bytes.len() as i64;
        self.storage
            .put_object(storage_path, bytes, Some(mime_type.to_string()))
            .await?;

        let file_name = storage_path
            .rsplit('/')
            .next()
            .unwrap_or(storage_path)
            .to_string();
        let storage_path = storage_path.to_string();
        let mime_type = mime_type.to_string();
        self.with_conn(move |conn| {
            let media = diesel::insert_into(media_files::table)
                .values(&NewMediaFile {
                    id: Uuid::new_v4(),
                    tenant_id,
                    message_id: None,
                    conversation_id: None,
                    file_name,
                    storage_backend: "s3".into(),
                    storage_path,
                    mime_type: Some(mime_type),
                    file_size: size,
                })
                .get_result::<MediaFile>(conn)
                .context("failed to insert media file")?;
            Ok(media)
        })
        .await
    }

    pub async fn media(&self, id: Uuid) -> Result<MediaFile> {
        self.with_conn(move |conn| {
            media_files::table
                .find(id)
                .first::<MediaFile>(conn)
                .context("media file missing")
        })
        .await
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        ledger::ensure_ledger_constraint(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE media_files, messages, participants, conversations, extensions, sync_states, tenants RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}
