use std::{
    fs,
    io::{ErrorKind, Write},
    process::Command,
};

use async_trait::async_trait;
use image::{
    codecs::{
        jpeg::JpegEncoder,
        png::{CompressionType, FilterType as PngFilter, PngEncoder},
    },
    imageops::FilterType,
    DynamicImage, GenericImageView,
};
use tempfile::{Builder as TempBuilder, NamedTempFile};
use thiserror::Error;
use tokio::task;

use crate::config::CompressionSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaCategory {
    Image,
    Video,
    /// Already-efficient or undecodable formats; never transcoded.
    Other,
}

impl MediaCategory {
    pub fn of(mime_type: Option<&str>, file_name: &str) -> Self {
        let mime = mime_type
            .map(|mime| mime.trim().to_ascii_lowercase())
            .filter(|mime| !mime.is_empty() && mime != "application/octet-stream")
            .or_else(|| {
                mime_guess::from_path(file_name)
                    .first()
                    .map(|mime| mime.essence_str().to_string())
            });

        match mime.as_deref() {
            Some("image/jpeg" | "image/jpg" | "image/png") => MediaCategory::Image,
            Some(mime) if mime.starts_with("video/") => MediaCategory::Video,
            _ => MediaCategory::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaCategory::Image => "image",
            MediaCategory::Video => "video",
            MediaCategory::Other => "other",
        }
    }

    pub fn min_bytes(&self, settings: &CompressionSettings) -> Option<i64> {
        match self {
            MediaCategory::Image => Some(settings.image_min_bytes),
            MediaCategory::Video => Some(settings.video_min_bytes),
            MediaCategory::Other => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcoded {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub extension: &'static str,
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("{0} files are not transcoded")]
    Unsupported(&'static str),
    #[error("could not decode media: {0}")]
    Decode(String),
    #[error("ffmpeg binary not found")]
    BinaryMissing,
    #[error("transcode failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(
        &self,
        category: MediaCategory,
        bytes: Vec<u8>,
    ) -> Result<Transcoded, TranscodeError>;
}

/// Images through the `image` crate, videos through an `ffmpeg` subprocess.
pub struct MediaTranscoder {
    settings: CompressionSettings,
}

impl MediaTranscoder {
    pub fn new(settings: CompressionSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Transcoder for MediaTranscoder {
    async fn transcode(
        &self,
        category: MediaCategory,
        bytes: Vec<u8>,
    ) -> Result<Transcoded, TranscodeError> {
        let settings = self.settings.clone();
        let job = match category {
            MediaCategory::Image => {
                task::spawn_blocking(move || reencode_image(&bytes, &settings))
            }
            MediaCategory::Video => task::spawn_blocking(move || reencode_video(&bytes, &settings)),
            MediaCategory::Other => return Err(TranscodeError::Unsupported(category.as_str())),
        };
        job.await
            .map_err(|err| TranscodeError::Failed(err.to_string()))?
    }
}

pub fn reencode_image(
    bytes: &[u8],
    settings: &CompressionSettings,
) -> Result<Transcoded, TranscodeError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|err| TranscodeError::Decode(err.to_string()))?;
    let decoded = shrink_to(decoded, settings.max_image_dimension);

    let mut out = Vec::new();
    if decoded.color().has_alpha() {
        // Transparency would be lost as JPEG.
        let encoder =
            PngEncoder::new_with_quality(&mut out, CompressionType::Best, PngFilter::Adaptive);
        decoded
            .write_with_encoder(encoder)
            .map_err(|err| TranscodeError::Failed(err.to_string()))?;
        return Ok(Transcoded {
            bytes: out,
            mime_type: "image/png".into(),
            extension: "png",
        });
    }

    let encoder = JpegEncoder::new_with_quality(&mut out, settings.jpeg_quality.clamp(1, 100));
    DynamicImage::ImageRgb8(decoded.to_rgb8())
        .write_with_encoder(encoder)
        .map_err(|err| TranscodeError::Failed(err.to_string()))?;
    Ok(Transcoded {
        bytes: out,
        mime_type: "image/jpeg".into(),
        extension: "jpg",
    })
}

fn shrink_to(image: DynamicImage, max_dimension: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if max_dimension == 0 || (width <= max_dimension && height <= max_dimension) {
        return image;
    }
    image.resize(max_dimension, max_dimension, FilterType::Lanczos3)
}

fn reencode_video(
    bytes: &[u8],
    settings: &CompressionSettings,
) -> Result<Transcoded, TranscodeError> {
    let failed = |err: std::io::Error| TranscodeError::Failed(err.to_string());

    let mut input = NamedTempFile::new().map_err(failed)?;
    input.write_all(bytes).map_err(failed)?;
    input.flush().map_err(failed)?;
    let output = TempBuilder::new()
        .suffix(".mp4")
        .tempfile()
        .map_err(failed)?;

    let result = Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
        .arg(input.path())
        .args(["-c:v", "libx264", "-preset", "medium", "-crf"])
        .arg(settings.ffmpeg_crf.to_string())
        .args(["-c:a", "aac", "-b:a", "128k", "-movflags", "+faststart"])
        .arg(output.path())
        .output();

    match result {
        Ok(run) if run.status.success() => {
            let bytes = fs::read(output.path()).map_err(failed)?;
            if bytes.is_empty() {
                return Err(TranscodeError::Failed("ffmpeg produced no output".into()));
            }
            Ok(Transcoded {
                bytes,
                mime_type: "video/mp4".into(),
                extension: "mp4",
            })
        }
        Ok(run) => Err(TranscodeError::Failed(format!(
            "ffmpeg exit={} stderr={}",
            run.status,
            String::from_utf8_lossy(&run.stderr).trim()
        ))),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(TranscodeError::BinaryMissing),
        Err(err) => Err(failed(err)),
    }
}

#[cfg(test)]
mod tests {
    use image::{ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};

    use super::*;

    fn png_bytes(image: DynamicImage) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        image.write_to(&mut cursor, ImageFormat::Png).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn categories_follow_mime_then_extension() {
        assert_eq!(MediaCategory::of(Some("image/jpeg"), "x"), MediaCategory::Image);
        assert_eq!(MediaCategory::of(Some("video/quicktime"), "x"), MediaCategory::Video);
        assert_eq!(MediaCategory::of(None, "clip.mp4"), MediaCategory::Video);
        assert_eq!(
            MediaCategory::of(Some("application/octet-stream"), "IMG_1.png"),
            MediaCategory::Image
        );
        assert_eq!(MediaCategory::of(Some("image/gif"), "a.gif"), MediaCategory::Other);
        assert_eq!(MediaCategory::of(Some("application/pdf"), "a.pdf"), MediaCategory::Other);
    }

    #[test]
    fn opaque_png_becomes_jpeg_and_is_downscaled() {
        let source = DynamicImage::ImageRgb8(RgbImage::from_pixel(400, 200, Rgb([10, 120, 200])));
        let settings = CompressionSettings {
            max_image_dimension: 100,
            ..CompressionSettings::default()
        };

        let out = reencode_image(&png_bytes(source), &settings).unwrap();

        assert_eq!(out.mime_type, "image/jpeg");
        assert_eq!(out.extension, "jpg");
        let decoded = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (100, 50));
    }

    #[test]
    fn transparent_image_stays_png() {
        let source = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 0])));
        let out = reencode_image(&png_bytes(source), &CompressionSettings::default()).unwrap();
        assert_eq!(out.mime_type, "image/png");
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = reencode_image(b"not an image", &CompressionSettings::default()).unwrap_err();
        assert!(matches!(err, TranscodeError::Decode(_)));
    }
}
