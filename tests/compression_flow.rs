mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{acquire_db_lock, FixedRatioTranscoder, TestContext};
use pbx_archiver::compression::{
    self, CompressionOptions, CompressionPipeline, STATUS_COMPRESSED, STATUS_SKIPPED,
};
use pbx_archiver::linker::tenant_media_prefix;
use pbx_archiver::models::MediaFile;
use pbx_archiver::storage::ObjectStorage;

const TEN_MB: usize = 10_000_000;

fn original_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn pipeline(ctx: &TestContext, percent: usize) -> CompressionPipeline {
    CompressionPipeline::new(ctx.state.clone(), Arc::new(FixedRatioTranscoder { percent }))
}

/// Everything restore promises to put back.
fn restorable(media: &MediaFile) -> (String, String, String, Option<String>, i64, Option<i64>, Option<String>) {
    (
        media.file_name.clone(),
        media.storage_backend.clone(),
        media.storage_path.clone(),
        media.mime_type.clone(),
        media.file_size,
        media.original_size,
        media.compression_status.clone(),
    )
}

#[tokio::test]
async fn two_percent_saving_leaves_file_untouched() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(ctx) = TestContext::new().await? else {
        return Ok(());
    };
    let tenant_id = ctx.insert_tenant("Marginal").await?;
    let path = format!("{}big.jpg", tenant_media_prefix(tenant_id));
    let media = ctx
        .insert_media(tenant_id, &path, "image/jpeg", original_bytes(TEN_MB))
        .await?;

    let report = pipeline(&ctx, 98).run(&CompressionOptions::default()).await?;
    assert_eq!(report.examined, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.compressed, 0);
    assert_eq!(report.failed, 0);

    let stored = ctx.storage().get(&path).await.expect("original still stored");
    assert_eq!(stored.bytes, original_bytes(TEN_MB));

    let after = ctx.media(media.id).await?;
    assert_eq!(after.file_size, TEN_MB as i64);
    assert_eq!(after.storage_path, path);
    assert_eq!(after.compression_status.as_deref(), Some(STATUS_SKIPPED));
    assert!(after.original_size.is_none());

    // Skipped files are not examined again.
    let rerun = pipeline(&ctx, 98).run(&CompressionOptions::default()).await?;
    assert_eq!(rerun.examined, 0);
    Ok(())
}

#[tokio::test]
async fn worthwhile_saving_replaces_object_and_exact_size() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(ctx) = TestContext::new().await? else {
        return Ok(());
    };
    let tenant_id = ctx.insert_tenant("Worthwhile").await?;
    let path = format!("{}big.jpg", tenant_media_prefix(tenant_id));
    let media = ctx
        .insert_media(tenant_id, &path, "image/jpeg", original_bytes(TEN_MB))
        .await?;

    let report = pipeline(&ctx, 60).run(&CompressionOptions::default()).await?;
    assert_eq!(report.compressed, 1);
    assert_eq!(report.saved_bytes(), 4_000_000);
    assert!(report.manifest.is_some());

    let stored = ctx.storage().get(&path).await.expect("replacement stored");
    assert_eq!(stored.bytes.len(), 6_000_000);
    assert_eq!(stored.content_type.as_deref(), Some("image/jpeg"));

    let after = ctx.media(media.id).await?;
    assert_eq!(after.file_size, 6_000_000);
    assert_eq!(after.original_size, Some(TEN_MB as i64));
    assert_eq!(after.compression_status.as_deref(), Some(STATUS_COMPRESSED));
    assert_eq!(after.id, media.id);
    Ok(())
}

#[tokio::test]
async fn backup_compress_restore_round_trips_bytes_and_record() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(ctx) = TestContext::new().await? else {
        return Ok(());
    };
    let tenant_id = ctx.insert_tenant("Roundtrip").await?;
    let prefix = tenant_media_prefix(tenant_id);
    let png_path = format!("{prefix}screenshot.png");
    let jpg_path = format!("{prefix}photo.jpg");
    let png_bytes = original_bytes(300_000);
    let jpg_bytes = original_bytes(400_000);
    let png = ctx
        .insert_media(tenant_id, &png_path, "image/png", png_bytes.clone())
        .await?;
    let jpg = ctx
        .insert_media(tenant_id, &jpg_path, "image/jpeg", jpg_bytes.clone())
        .await?;
    let before = [restorable(&png), restorable(&jpg)];

    let report = pipeline(&ctx, 50).run(&CompressionOptions::default()).await?;
    assert_eq!(report.compressed, 2);
    let manifest = report.manifest.expect("manifest written");

    // The png was re-encoded as jpeg under a new name; the old object is gone.
    let moved = ctx.media(png.id).await?;
    assert_eq!(moved.storage_path, format!("{prefix}screenshot.jpg"));
    assert!(ctx.storage().get(&png_path).await.is_none());

    let restored = compression::restore(&ctx.state, &manifest).await?;
    assert_eq!(restored.restored, 2);
    assert_eq!(restored.failed, 0);

    let after = [
        restorable(&ctx.media(png.id).await?),
        restorable(&ctx.media(jpg.id).await?),
    ];
    assert_eq!(after, before);

    let storage = ctx.storage();
    assert_eq!(storage.get(&png_path).await.map(|o| o.bytes), Some(png_bytes));
    assert_eq!(storage.get(&jpg_path).await.map(|o| o.bytes), Some(jpg_bytes));
    assert!(storage.get(&format!("{prefix}screenshot.jpg")).await.is_none());
    Ok(())
}

#[tokio::test]
async fn untracked_object_at_rewritten_path_is_left_alone() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(ctx) = TestContext::new().await? else {
        return Ok(());
    };
    let tenant_id = ctx.insert_tenant("Occupied").await?;
    let prefix = tenant_media_prefix(tenant_id);
    let png_path = format!("{prefix}scan.png");
    let jpg_path = format!("{prefix}scan.jpg");

    // Uploaded by hand, no record points at it.
    let foreign = b"not ours".to_vec();
    ctx.storage()
        .put_object(&jpg_path, foreign.clone(), Some("image/jpeg".into()))
        .await?;
    let png = ctx
        .insert_media(tenant_id, &png_path, "image/png", original_bytes(400_000))
        .await?;

    let report = pipeline(&ctx, 50).run(&CompressionOptions::default()).await?;
    assert_eq!(report.compressed, 1);

    let short = &png.id.simple().to_string()[..8];
    let expected = format!("{prefix}scan-{short}.jpg");
    let moved = ctx.media(png.id).await?;
    assert_eq!(moved.storage_path, expected);

    let storage = ctx.storage();
    assert_eq!(storage.get(&jpg_path).await.map(|o| o.bytes), Some(foreign));
    assert_eq!(storage.get(&expected).await.map(|o| o.bytes.len()), Some(200_000));
    assert!(storage.get(&png_path).await.is_none());
    Ok(())
}

#[tokio::test]
async fn standalone_backup_restores_unattended() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(ctx) = TestContext::new().await? else {
        return Ok(());
    };
    let tenant_id = ctx.insert_tenant("Standalone").await?;
    let path = format!("{}clip.mp4", tenant_media_prefix(tenant_id));
    let bytes = original_bytes(8_000_000);
    let video = ctx
        .insert_media(tenant_id, &path, "video/mp4", bytes.clone())
        .await?;

    let backup = compression::backup_inventory(&ctx.state, &ctx.backup_dir(), Some(tenant_id)).await?;
    assert_eq!(backup.entries(), 1);
    let manifest = backup.manifest_path();

    let report = pipeline(&ctx, 40).run(&CompressionOptions::default()).await?;
    assert_eq!(report.compressed, 1);

    compression::restore(&ctx.state, &manifest).await?;
    let after = ctx.media(video.id).await?;
    assert_eq!(restorable(&after), restorable(&video));
    assert_eq!(ctx.storage().get(&path).await.map(|o| o.bytes), Some(bytes));
    Ok(())
}

#[tokio::test]
async fn dry_run_reports_without_mutating() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let Some(ctx) = TestContext::new().await? else {
        return Ok(());
    };
    let tenant_id = ctx.insert_tenant("Dry").await?;
    let prefix = tenant_media_prefix(tenant_id);
    let media = ctx
        .insert_media(tenant_id, &format!("{prefix}big.png"), "image/png", original_bytes(TEN_MB))
        .await?;
    // Below the image threshold configured by the harness.
    ctx.insert_media(tenant_id, &format!("{prefix}tiny.jpg"), "image/jpeg", original_bytes(100))
        .await?;

    let options = CompressionOptions {
        dry_run: true,
        tenant_id: Some(tenant_id),
        limit: None,
    };
    let report = pipeline(&ctx, 60).run(&options).await?;
    assert_eq!(report.examined, 1);
    assert_eq!(report.compressed, 1);
    assert_eq!(report.saved_bytes(), 4_000_000);
    assert!(report.manifest.is_none());

    let after = ctx.media(media.id).await?;
    assert_eq!(restorable(&after), restorable(&media));
    assert_eq!(
        ctx.storage().keys().await,
        vec![format!("{prefix}big.png"), format!("{prefix}tiny.jpg")]
    );
    Ok(())
}
