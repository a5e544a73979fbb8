use image::{imageops::FilterType, ImageFormat};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::{CodecError, CodecResult};

/// Default size of generated thumbnails (square bound)
pub const THUMBNAIL_SIZE: u32 = 256;

/// Generate a PNG thumbnail that fits inside `size` x `size`
///
/// Accepts anything the image crate can decode (PNG, JPEG, WebP, ...).
/// Images already smaller than the bound are re-encoded without upscaling.
pub fn generate_thumbnail(image_bytes: &[u8], size: u32) -> CodecResult<Vec<u8>> {
    let img = image::load_from_memory(image_bytes)
        .map_err(|e| CodecError::InvalidImageFormat(e.to_string()))?;

    let thumbnail = if img.width() > size || img.height() > size {
        img.resize(size, size, FilterType::Lanczos3)
    } else {
        img
    };

    let mut out = Cursor::new(Vec::new());
    thumbnail
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| CodecError::InvalidImageFormat(e.to_string()))?;

    tracing::debug!(
        width = thumbnail.width(),
        height = thumbnail.height(),
        "📸 generated thumbnail"
    );
    Ok(out.into_inner())
}

/// blake3 hex digest used for duplicate detection
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Get the thumbnail path for an entry id (doesn't generate, just returns the expected path)
pub fn thumbnail_path(cache_dir: &Path, entry_id: &str) -> PathBuf {
    cache_dir.join(format!("{}.png", entry_id))
}

/// Write a thumbnail into the cache so external viewers can show it by path
pub fn cache_thumbnail(cache_dir: &Path, entry_id: &str, png: &[u8]) -> std::io::Result<PathBuf> {
    fs::create_dir_all(cache_dir)?;
    let path = thumbnail_path(cache_dir, entry_id);
    fs::write(&path, png)?;
    Ok(path)
}

/// Remove a cached thumbnail; missing files are fine
pub fn evict_thumbnail(cache_dir: &Path, entry_id: &str) -> std::io::Result<()> {
    match fs::remove_file(thumbnail_path(cache_dir, entry_id)) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
