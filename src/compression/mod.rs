//! Out-of-band media compression with a restorable backup.
//!
//! Files are re-encoded only when the result is meaningfully smaller. Every
//! committed replacement is preceded by a manifest entry and a local copy of
//! the original bytes, which `restore` replays to undo a run.

use std::{path::Path, sync::Arc};

use chrono::Utc;
use diesel::{pg::PgConnection, prelude::*};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::CompressionSettings,
    error::{SyncError, SyncResult},
    models::MediaFile,
    schema::media_files,
    state::EngineState,
    storage::{ObjectStorage, StorageBackend},
};

pub mod manifest;
pub mod transcode;

pub use manifest::{BackupWriter, ManifestEntry};
pub use transcode::{MediaCategory, MediaTranscoder, TranscodeError, Transcoded, Transcoder};

pub const STATUS_COMPRESSED: &str = "compressed";
pub const STATUS_SKIPPED: &str = "skipped";

#[derive(Debug, Clone, Default)]
pub struct CompressionOptions {
    pub dry_run: bool,
    pub tenant_id: Option<Uuid>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Replace { saved_percent: f64 },
    NotBeneficial { saved_percent: f64 },
}

/// Whether a re-encode from `original` to `candidate` bytes is worth committing.
pub fn evaluate(original: i64, candidate: i64, min_benefit_percent: f64) -> Decision {
    if original <= 0 {
        return Decision::NotBeneficial { saved_percent: 0.0 };
    }
    let saved_percent = (original - candidate) as f64 * 100.0 / original as f64;
    if candidate > 0 && saved_percent > min_benefit_percent {
        Decision::Replace { saved_percent }
    } else {
        Decision::NotBeneficial { saved_percent }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompressionOutcome {
    Compressed {
        original_size: i64,
        new_size: i64,
        new_path: String,
    },
    /// Dry run: what a real run would have committed.
    WouldCompress { original_size: i64, new_size: i64 },
    /// The original is kept. Not an error.
    Skipped { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressionReport {
    pub examined: usize,
    pub compressed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes_before: i64,
    pub bytes_after: i64,
    pub manifest: Option<std::path::PathBuf>,
}

impl CompressionReport {
    pub fn saved_bytes(&self) -> i64 {
        self.bytes_before - self.bytes_after
    }

    fn record(&mut self, outcome: &CompressionOutcome) {
        match outcome {
            CompressionOutcome::Compressed {
                original_size,
                new_size,
                ..
            }
            | CompressionOutcome::WouldCompress {
                original_size,
                new_size,
            } => {
                self.compressed += 1;
                self.bytes_before += original_size;
                self.bytes_after += new_size;
            }
            CompressionOutcome::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Files not yet processed whose category threshold they exceed, largest first.
pub fn select_candidates(
    conn: &mut PgConnection,
    settings: &CompressionSettings,
    options: &CompressionOptions,
) -> SyncResult<Vec<MediaFile>> {
    let floor = settings.image_min_bytes.min(settings.video_min_bytes);
    let mut query = media_files::table
        .filter(media_files::compression_status.is_null())
        .filter(media_files::file_size.ge(floor))
        .order((media_files::file_size.desc(), media_files::id.asc()))
        .into_boxed();
    if let Some(tenant_id) = options.tenant_id {
        query = query.filter(media_files::tenant_id.eq(tenant_id));
    }

    let rows: Vec<MediaFile> = query.load(conn)?;
    let selected = rows.into_iter().filter(|media| {
        MediaCategory::of(media.mime_type.as_deref(), &media.file_name)
            .min_bytes(settings)
            .is_some_and(|min| media.file_size >= min)
    });
    Ok(match options.limit {
        Some(limit) => selected.take(limit).collect(),
        None => selected.collect(),
    })
}

/// Same location with the encoder's extension, e.g. `a/IMG_1.png` to `a/IMG_1.jpg`.
pub fn rewrite_extension(path: &str, extension: &str) -> String {
    let (dir, name) = match path.rfind('/') {
        Some(split) => path.split_at(split + 1),
        None => ("", path),
    };
    let (stem, current) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], Some(&name[dot + 1..])),
        _ => (name, None),
    };
    let same = current.is_some_and(|current| {
        let current = current.to_ascii_lowercase();
        current == extension || (extension == "jpg" && current == "jpeg")
    });
    if same {
        path.to_string()
    } else {
        format!("{dir}{stem}.{extension}")
    }
}

fn mark_skipped(conn: &mut PgConnection, media_id: Uuid) -> SyncResult<()> {
    diesel::update(media_files::table.find(media_id))
        .set((
            media_files::compression_status.eq(Some(STATUS_SKIPPED)),
            media_files::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Whether another record on the same backend already points at `path`.
fn path_recorded(conn: &mut PgConnection, media: &MediaFile, path: &str) -> SyncResult<bool> {
    let taken: i64 = media_files::table
        .filter(media_files::storage_backend.eq(&media.storage_backend))
        .filter(media_files::storage_path.eq(path))
        .filter(media_files::id.ne(media.id))
        .count()
        .get_result(conn)?;
    Ok(taken > 0)
}

async fn object_exists(storage: &dyn ObjectStorage, key: &str) -> SyncResult<bool> {
    let listed = storage.list_objects(key).await.map_err(SyncError::Storage)?;
    Ok(listed.iter().any(|object| object.key == key))
}

/// `a/IMG_1.jpg` to `a/IMG_1-1a2b3c4d.jpg`, using the record's id.
fn suffixed_path(media_id: Uuid, proposed: &str) -> String {
    let short = &media_id.simple().to_string()[..8];
    let name_start = proposed.rfind('/').map_or(0, |slash| slash + 1);
    match proposed[name_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let dot = name_start + dot;
            format!("{}-{short}{}", &proposed[..dot], &proposed[dot..])
        }
        _ => format!("{proposed}-{short}"),
    }
}

/// Points the record at the new object, provided nobody moved it meanwhile.
fn apply_replacement(
    conn: &mut PgConnection,
    media: &MediaFile,
    new_path: &str,
    transcoded: &Transcoded,
) -> SyncResult<bool> {
    let updated = diesel::update(
        media_files::table
            .filter(media_files::id.eq(media.id))
            .filter(media_files::storage_path.eq(&media.storage_path))
            .filter(media_files::compression_status.is_null()),
    )
    .set((
        media_files::storage_path.eq(new_path),
        media_files::mime_type.eq(Some(&transcoded.mime_type)),
        media_files::file_size.eq(transcoded.bytes.len() as i64),
        media_files::original_size.eq(Some(media.file_size)),
        media_files::compression_status.eq(Some(STATUS_COMPRESSED)),
        media_files::updated_at.eq(Utc::now().naive_utc()),
    ))
    .execute(conn)?;
    Ok(updated == 1)
}

pub struct CompressionPipeline {
    state: EngineState,
    transcoder: Arc<dyn Transcoder>,
}

impl CompressionPipeline {
    pub fn new(state: EngineState, transcoder: Arc<dyn Transcoder>) -> Self {
        Self { state, transcoder }
    }

    pub async fn run(&self, options: &CompressionOptions) -> SyncResult<CompressionReport> {
        let settings = self.state.config.compression.clone();
        let candidates = {
            let settings = settings.clone();
            let options = options.clone();
            self.state
                .with_db(move |conn| select_candidates(conn, &settings, &options))
                .await?
        };

        let mut backup = if options.dry_run || candidates.is_empty() {
            None
        } else {
            Some(
                BackupWriter::create(&self.state.config.backup_dir)
                    .await
                    .map_err(SyncError::Storage)?,
            )
        };

        let mut report = CompressionReport::default();
        for media in &candidates {
            report.examined += 1;
            match self.process(media, options, backup.as_mut()).await {
                Ok(outcome) => report.record(&outcome),
                Err(err) => {
                    report.failed += 1;
                    warn!(media_id = %media.id, error = %err, "compression failed; original kept");
                }
            }
        }
        report.manifest = backup.map(|writer| writer.manifest_path());

        info!(
            dry_run = options.dry_run,
            examined = report.examined,
            compressed = report.compressed,
            skipped = report.skipped,
            failed = report.failed,
            saved_bytes = report.saved_bytes(),
            "compression run finished"
        );
        Ok(report)
    }

    pub async fn process(
        &self,
        media: &MediaFile,
        options: &CompressionOptions,
        backup: Option<&mut BackupWriter>,
    ) -> SyncResult<CompressionOutcome> {
        let category = MediaCategory::of(media.mime_type.as_deref(), &media.file_name);
        let storage = self
            .state
            .storage
            .for_media(media)
            .map_err(SyncError::Storage)?;
        let original = storage
            .get_object(&media.storage_path)
            .await
            .map_err(SyncError::Storage)?;

        let transcoded = match self.transcoder.transcode(category, original.clone()).await {
            Ok(transcoded) => transcoded,
            Err(err @ (TranscodeError::Unsupported(_) | TranscodeError::Decode(_))) => {
                return self.skip(media, options, err.to_string()).await;
            }
            Err(err) => return Err(SyncError::Storage(err.into())),
        };

        let original_size = original.len() as i64;
        let new_size = transcoded.bytes.len() as i64;
        let min_benefit = self.state.config.compression.min_benefit_percent;
        if let Decision::NotBeneficial { saved_percent } =
            evaluate(original_size, new_size, min_benefit)
        {
            return self
                .skip(
                    media,
                    options,
                    format!("saves {saved_percent:.1}%, below {min_benefit}%"),
                )
                .await;
        }

        if options.dry_run {
            return Ok(CompressionOutcome::WouldCompress {
                original_size,
                new_size,
            });
        }

        let backup = backup.ok_or_else(|| {
            SyncError::Storage(anyhow::anyhow!("refusing to compress without a backup"))
        })?;
        backup
            .record(media, &original)
            .await
            .map_err(SyncError::Storage)?;

        let proposed = rewrite_extension(&media.storage_path, transcoded.extension);
        let new_path = self
            .free_target_path(storage.as_ref(), media, proposed)
            .await?;

        storage
            .put_object(&new_path, transcoded.bytes.clone(), Some(transcoded.mime_type.clone()))
            .await
            .map_err(SyncError::Storage)?;

        let applied = {
            let media = media.clone();
            let new_path = new_path.clone();
            let transcoded = transcoded.clone();
            self.state
                .with_db(move |conn| apply_replacement(conn, &media, &new_path, &transcoded))
                .await
        };
        if !matches!(applied, Ok(true)) {
            // The record still describes the original; undo the upload.
            let undo = if new_path == media.storage_path {
                storage
                    .put_object(&new_path, original, media.mime_type.clone())
                    .await
            } else {
                storage.delete_object(&new_path).await
            };
            if let Err(err) = undo {
                warn!(media_id = %media.id, error = %err, "failed to undo replacement upload");
            }
            applied?;
            return Ok(CompressionOutcome::Skipped {
                reason: "record changed during compression".into(),
            });
        }

        if new_path != media.storage_path {
            if let Err(err) = storage.delete_object(&media.storage_path).await {
                warn!(
                    media_id = %media.id,
                    path = %media.storage_path,
                    error = %err,
                    "compressed copy committed but old object was not deleted"
                );
            }
        }

        info!(
            media_id = %media.id,
            original_size,
            new_size,
            "media compressed"
        );
        Ok(CompressionOutcome::Compressed {
            original_size,
            new_size,
            new_path,
        })
    }

    /// Picks a target path that neither another record nor an untracked
    /// object on the backend already occupies.
    async fn free_target_path(
        &self,
        storage: &dyn ObjectStorage,
        media: &MediaFile,
        proposed: String,
    ) -> SyncResult<String> {
        if proposed == media.storage_path {
            return Ok(proposed);
        }
        let recorded = {
            let media = media.clone();
            let proposed = proposed.clone();
            self.state
                .with_db(move |conn| path_recorded(conn, &media, &proposed))
                .await?
        };
        if !recorded && !object_exists(storage, &proposed).await? {
            return Ok(proposed);
        }
        let target = suffixed_path(media.id, &proposed);
        info!(media_id = %media.id, occupied = %proposed, target = %target, "target path occupied");
        Ok(target)
    }

    async fn skip(
        &self,
        media: &MediaFile,
        options: &CompressionOptions,
        reason: String,
    ) -> SyncResult<CompressionOutcome> {
        if !options.dry_run {
            let media_id = media.id;
            self.state
                .with_db(move |conn| mark_skipped(conn, media_id))
                .await?;
        }
        Ok(CompressionOutcome::Skipped { reason })
    }
}

/// Copies current originals into a backup set without changing anything.
pub async fn backup_inventory(
    state: &EngineState,
    backup_dir: &Path,
    tenant_id: Option<Uuid>,
) -> SyncResult<BackupWriter> {
    let files: Vec<MediaFile> = state
        .with_db(move |conn| {
            let mut query = media_files::table
                .order(media_files::created_at.asc())
                .into_boxed();
            if let Some(tenant_id) = tenant_id {
                query = query.filter(media_files::tenant_id.eq(tenant_id));
            }
            Ok(query.load(conn)?)
        })
        .await?;

    let mut writer = BackupWriter::create(backup_dir)
        .await
        .map_err(SyncError::Storage)?;
    for media in &files {
        let storage = state.storage.for_media(media).map_err(SyncError::Storage)?;
        let bytes = storage
            .get_object(&media.storage_path)
            .await
            .map_err(SyncError::Storage)?;
        writer
            .record(media, &bytes)
            .await
            .map_err(SyncError::Storage)?;
    }
    info!(files = writer.entries(), manifest = %writer.manifest_path().display(), "backup written");
    Ok(writer)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub missing: usize,
    pub failed: usize,
}

/// Puts every file in the manifest back exactly as it was recorded.
pub async fn restore(state: &EngineState, manifest_path: &Path) -> SyncResult<RestoreReport> {
    let entries = manifest::read_manifest(manifest_path)
        .await
        .map_err(SyncError::Storage)?;

    let mut report = RestoreReport::default();
    for entry in &entries {
        match restore_entry(state, entry).await {
            Ok(true) => report.restored += 1,
            Ok(false) => report.missing += 1,
            Err(err) => {
                report.failed += 1;
                warn!(media_id = %entry.id, error = %err, "restore failed");
            }
        }
    }
    info!(
        restored = report.restored,
        missing = report.missing,
        failed = report.failed,
        "restore finished"
    );
    Ok(report)
}

async fn restore_entry(state: &EngineState, entry: &ManifestEntry) -> SyncResult<bool> {
    let original = manifest::load_original(entry)
        .await
        .map_err(SyncError::Storage)?;

    let media_id = entry.id;
    let Some(current) = state
        .with_db(move |conn| {
            Ok(media_files::table
                .find(media_id)
                .first::<MediaFile>(conn)
                .optional()?)
        })
        .await?
    else {
        warn!(media_id = %entry.id, "media record no longer exists; skipping");
        return Ok(false);
    };

    let backend: StorageBackend = entry.storage_backend.parse().map_err(SyncError::Storage)?;
    let target = state.storage.get(backend).map_err(SyncError::Storage)?;
    target
        .put_object(&entry.storage_path, original, entry.mime_type.clone())
        .await
        .map_err(SyncError::Storage)?;

    let restored = entry.clone();
    state
        .with_db(move |conn| {
            diesel::update(media_files::table.find(restored.id))
                .set((
                    media_files::file_name.eq(&restored.file_name),
                    media_files::storage_backend.eq(&restored.storage_backend),
                    media_files::storage_path.eq(&restored.storage_path),
                    media_files::mime_type.eq(&restored.mime_type),
                    media_files::file_size.eq(restored.file_size),
                    media_files::original_size.eq::<Option<i64>>(None),
                    media_files::compression_status.eq::<Option<String>>(None),
                    media_files::updated_at.eq(Utc::now().naive_utc()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await?;

    let moved = current.storage_backend != entry.storage_backend
        || current.storage_path != entry.storage_path;
    if moved {
        match state.storage.for_media(&current) {
            Ok(storage) => {
                if let Err(err) = storage.delete_object(&current.storage_path).await {
                    warn!(media_id = %entry.id, error = %err, "restored, but compressed copy was not deleted");
                }
            }
            Err(err) => warn!(media_id = %entry.id, error = %err, "cannot resolve storage of compressed copy"),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: i64 = 1_000_000;

    #[test]
    fn two_percent_saving_is_not_worth_it() {
        let decision = evaluate(10 * MB, 9_800_000, 5.0);
        assert!(matches!(decision, Decision::NotBeneficial { saved_percent } if (saved_percent - 2.0).abs() < 1e-9));
    }

    #[test]
    fn forty_percent_saving_replaces() {
        assert!(matches!(
            evaluate(10 * MB, 6 * MB, 5.0),
            Decision::Replace { .. }
        ));
    }

    #[test]
    fn growth_and_empty_output_never_replace() {
        assert!(matches!(evaluate(MB, 2 * MB, 5.0), Decision::NotBeneficial { .. }));
        assert!(matches!(evaluate(MB, 0, 5.0), Decision::NotBeneficial { .. }));
        assert!(matches!(evaluate(0, 0, 5.0), Decision::NotBeneficial { .. }));
    }

    #[test]
    fn extension_rewrite_keeps_directory() {
        assert_eq!(
            rewrite_extension("tenants/a/media/IMG_1.png", "jpg"),
            "tenants/a/media/IMG_1.jpg"
        );
        assert_eq!(rewrite_extension("t/clip.MOV", "mp4"), "t/clip.mp4");
        assert_eq!(rewrite_extension("t/photo.JPEG", "jpg"), "t/photo.JPEG");
        assert_eq!(rewrite_extension("t/noext", "jpg"), "t/noext.jpg");
        assert_eq!(rewrite_extension(".hidden", "png"), ".hidden.png");
    }

    #[test]
    fn suffix_goes_before_the_extension_of_the_file_name() {
        let id = Uuid::parse_str("1a2b3c4d-0000-4000-8000-000000000000").unwrap();
        assert_eq!(suffixed_path(id, "t/IMG_1.jpg"), "t/IMG_1-1a2b3c4d.jpg");
        assert_eq!(suffixed_path(id, "t.v2/noext"), "t.v2/noext-1a2b3c4d");
    }

    #[test]
    fn report_totals_savings() {
        let mut report = CompressionReport::default();
        report.record(&CompressionOutcome::Compressed {
            original_size: 10,
            new_size: 6,
            new_path: "x".into(),
        });
        report.record(&CompressionOutcome::Skipped {
            reason: "small".into(),
        });
        assert_eq!(report.compressed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.saved_bytes(), 4);
    }
}
