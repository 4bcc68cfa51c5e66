//! JSON Lines backup manifests.
//!
//! Each line describes one media file as it was before the pipeline touched
//! it, plus where a verbatim local copy of its bytes lives. Lines are flushed
//! to disk before the stored object is replaced, so a crash mid-run still
//! leaves a manifest that covers everything already rewritten.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
};
use uuid::Uuid;

use crate::models::MediaFile;

pub const MANIFEST_FILE: &str = "manifest.jsonl";
const FILES_DIR: &str = "files";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub file_name: String,
    pub storage_backend: String,
    pub storage_path: String,
    pub mime_type: Option<String>,
    pub file_size: i64,
    pub local_path: PathBuf,
    pub sha256: String,
    pub recorded_at: NaiveDateTime,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub struct BackupWriter {
    root: PathBuf,
    manifest: File,
    entries: usize,
}

impl BackupWriter {
    /// Starts a new backup set in a timestamped directory under `backup_dir`.
    pub async fn create(backup_dir: &Path) -> Result<Self> {
        let root = backup_dir.join(format!(
            "{}-{}",
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            &Uuid::new_v4().simple().to_string()[..8]
        ));
        fs::create_dir_all(root.join(FILES_DIR))
            .await
            .with_context(|| format!("failed to create backup directory {}", root.display()))?;

        let manifest = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(root.join(MANIFEST_FILE))
            .await
            .context("failed to create backup manifest")?;

        Ok(Self {
            root,
            manifest,
            entries: 0,
        })
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Saves `bytes` as the original of `media` and appends its manifest line.
    pub async fn record(&mut self, media: &MediaFile, bytes: &[u8]) -> Result<ManifestEntry> {
        let local_path = self.root.join(FILES_DIR).join(media.id.to_string());
        let mut copy = File::create(&local_path)
            .await
            .with_context(|| format!("failed to write backup copy {}", local_path.display()))?;
        copy.write_all(bytes).await?;
        copy.sync_all().await?;

        let entry = ManifestEntry {
            id: media.id,
            tenant_id: media.tenant_id,
            file_name: media.file_name.clone(),
            storage_backend: media.storage_backend.clone(),
            storage_path: media.storage_path.clone(),
            mime_type: media.mime_type.clone(),
            file_size: media.file_size,
            local_path,
            sha256: sha256_hex(bytes),
            recorded_at: Utc::now().naive_utc(),
        };

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        self.manifest.write_all(&line).await?;
        self.manifest.flush().await?;
        self.manifest.sync_data().await?;
        self.entries += 1;
        Ok(entry)
    }
}

pub async fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let file = File::open(path)
        .await
        .with_context(|| format!("failed to open manifest {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut entries = Vec::new();
    let mut number = 0;
    while let Some(line) = lines.next_line().await? {
        number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let entry: ManifestEntry = serde_json::from_str(&line)
            .with_context(|| format!("manifest line {number} is invalid"))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Reads the backed-up original and checks it against the recorded digest.
pub async fn load_original(entry: &ManifestEntry) -> Result<Vec<u8>> {
    let bytes = fs::read(&entry.local_path)
        .await
        .with_context(|| format!("failed to read backup copy {}", entry.local_path.display()))?;
    let digest = sha256_hex(&bytes);
    if digest != entry.sha256 {
        bail!(
            "backup copy for {} does not match its checksum ({digest} != {})",
            entry.id,
            entry.sha256
        );
    }
    Ok(bytes)
}
