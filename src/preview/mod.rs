/// Preview handling
///
/// This module handles:
/// - Generating thumbnails from source images
/// - Content hashes used for duplicate detection
/// - Caching thumbnails to disk for display

pub mod thumbnail;

pub use thumbnail::{content_hash, generate_thumbnail, THUMBNAIL_SIZE};
