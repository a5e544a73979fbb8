/// Library configuration
///
/// Paths default to the platform directories:
/// - Linux: ~/.local/share/vibe-library (data), ~/.cache/vibe-library (cache)
/// - macOS: ~/Library/Application Support/vibe-library, ~/Library/Caches/vibe-library
/// - Windows: %APPDATA%\vibe-library, %LOCALAPPDATA%\vibe-library
///
/// Each can be overridden through the environment:
/// - `VIBE_LIBRARY_DIR` for the data directory
/// - `VIBE_LIBRARY_CACHE_DIR` for the cache directory
/// - `VIBE_LIBRARY_THUMBNAIL_SIZE` for the thumbnail bound in pixels
use std::path::PathBuf;

use crate::preview::THUMBNAIL_SIZE;

const APP_DIR: &str = "vibe-library";

#[derive(Debug, Clone, PartialEq)]
pub struct LibraryConfig {
    /// Catalog database, vibe files and migration backups live here
    pub data_dir: PathBuf,
    /// Thumbnails written for display; safe to delete
    pub cache_dir: PathBuf,
    pub thumbnail_size: u32,
}

impl LibraryConfig {
    /// Everything under one directory; used by tests and portable installs
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            cache_dir: root.join("cache"),
            data_dir: root,
            thumbnail_size: THUMBNAIL_SIZE,
        }
    }

    /// Platform defaults with environment overrides applied.
    /// Returns `None` when no home/data directory can be determined.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let data_dir = match lookup("VIBE_LIBRARY_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir().or_else(dirs::home_dir)?.join(APP_DIR),
        };
        let cache_dir = match lookup("VIBE_LIBRARY_CACHE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs_next::cache_dir()
                .map(|dir| dir.join(APP_DIR))
                .unwrap_or_else(|| data_dir.join("cache")),
        };
        let thumbnail_size = lookup("VIBE_LIBRARY_THUMBNAIL_SIZE")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|size| *size > 0)
            .unwrap_or(THUMBNAIL_SIZE);

        Some(Self {
            data_dir,
            cache_dir,
            thumbnail_size,
        })
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.db")
    }

    /// Single `.naiv4vibe` files; bundles live in `bundles/` below it
    pub fn vibes_dir(&self) -> PathBuf {
        self.data_dir.join("vibes")
    }

    pub fn backup_root(&self) -> PathBuf {
        self.data_dir.join("migration-backups")
    }

    pub fn thumbnail_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("thumbnails")
    }
}
