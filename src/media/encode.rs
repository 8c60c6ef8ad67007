// Frame encoding and snapshot archiving

use std::fs;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::constants::{JPEG_QUALITY, SNAPSHOT_EXTENSION};
use crate::error::{FramewiseError, Result};

/// Shrink to fit within `target_width` on both sides, then encode as JPEG.
/// Never upscales.
pub fn resize_and_encode(image: &DynamicImage, target_width: u32) -> Result<Vec<u8>> {
    if target_width == 0 {
        return Err(FramewiseError::Input("target width must be positive".to_string()));
    }

    let resized;
    let source = if image.width() > target_width || image.height() > target_width {
        resized = image.resize(target_width, target_width, FilterType::Triangle);
        &resized
    } else {
        image
    };

    // JPEG has no alpha or 16-bit modes
    let rgb = source.to_rgb8();

    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
    encoder.encode_image(&rgb)?;
    Ok(buf)
}

/// File name of an archived snapshot: `<prefix>-<seq>.jpg`.
pub fn snapshot_file_name(prefix: &str, seq: usize) -> String {
    format!("{}-{}.{}", prefix, seq, SNAPSHOT_EXTENSION)
}

/// Write a snapshot into `dir` as `<prefix>-<seq>.jpg`.
///
/// Writes to a temp file first and renames it into place.
pub fn archive_snapshot(payload: &[u8], dir: &Path, prefix: &str, seq: usize) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let output_path = dir.join(snapshot_file_name(prefix, seq));
    let tmp_path = output_path.with_extension("tmp.jpg");

    if let Err(e) = fs::write(&tmp_path, payload) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    fs::rename(&tmp_path, &output_path)?;

    log::debug!("Archived snapshot {}", output_path.display());
    Ok(output_path)
}
