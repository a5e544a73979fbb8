/// On-disk vibe files
///
/// Path naming and raw I/O only. Format concerns belong to the codecs.
///
/// Layout under the vibes directory:
/// - `<uuid>.naiv4vibe` single vibes (envelope JSON)
/// - `bundles/<uuid>.naiv4vibebundle` bundles
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::codec::bundle::BundleReader;
use crate::error::{StorageError, StorageResult};
use crate::state::data::VibeReference;

pub const VIBE_EXTENSION: &str = "naiv4vibe";
pub const BUNDLE_EXTENSION: &str = "naiv4vibebundle";

#[derive(Debug, Clone)]
pub struct FileStorage {
    vibes_dir: PathBuf,
    bundles_dir: PathBuf,
}

impl FileStorage {
    /// Use `vibes_dir` as the root, creating it if needed
    pub fn new(vibes_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let vibes_dir = vibes_dir.into();
        let bundles_dir = vibes_dir.join("bundles");
        fs::create_dir_all(&bundles_dir).map_err(|e| StorageError::io("create vibes directory", &bundles_dir, e))?;
        Ok(Self {
            vibes_dir,
            bundles_dir,
        })
    }

    pub fn vibes_dir(&self) -> &Path {
        &self.vibes_dir
    }

    /// Write a single-vibe file under a fresh name
    pub fn write_vibe_file(&self, bytes: &[u8]) -> StorageResult<PathBuf> {
        self.write_vibe_file_named(&uuid::Uuid::new_v4().to_string(), bytes)
    }

    /// Write a single-vibe file with a caller-chosen stem.
    /// Writing the same stem again replaces the file.
    pub fn write_vibe_file_named(&self, stem: &str, bytes: &[u8]) -> StorageResult<PathBuf> {
        let path = self.vibes_dir.join(format!("{}.{}", stem, VIBE_EXTENSION));
        write_atomic(&path, bytes)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "wrote vibe file");
        Ok(path)
    }

    pub fn write_bundle_file(&self, bytes: &[u8]) -> StorageResult<PathBuf> {
        let path = self
            .bundles_dir
            .join(format!("{}.{}", uuid::Uuid::new_v4(), BUNDLE_EXTENSION));
        write_atomic(&path, bytes)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "wrote bundle file");
        Ok(path)
    }

    pub fn read_file(&self, path: &Path) -> StorageResult<Vec<u8>> {
        fs::read(path).map_err(|e| StorageError::io("read vibe file", path, e))
    }

    /// Delete a file; one that is already gone counts as deleted
    pub fn delete_file(&self, path: &Path) -> StorageResult<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "deleted vibe file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io("delete vibe file", path, e)),
        }
    }

    /// Read one item of a bundle file without loading the other items
    pub fn extract_vibe_from_bundle(&self, path: &Path, index: usize) -> StorageResult<Option<VibeReference>> {
        let file = File::open(path).map_err(|e| StorageError::io("open bundle", path, e))?;
        let mut reader = BundleReader::new(BufReader::new(file))?;
        Ok(reader.read_reference(index)?)
    }

    /// Every vibe, bundle, and leftover temp file under the root
    pub fn list_files(&self) -> StorageResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.vibes_dir).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.vibes_dir.clone());
                StorageError::io("scan vibes directory", path, e.into())
            })?;
            if entry.file_type().is_file() && is_managed(entry.path()) {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Copy `path` to `dest`, creating parent directories
    pub fn copy_into(&self, path: &Path, dest: &Path) -> StorageResult<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io("create backup directory", parent, e))?;
        }
        fs::copy(path, dest).map_err(|e| StorageError::io("copy vibe file", path, e))?;
        Ok(())
    }
}

fn is_managed(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    name.ends_with(&format!(".{}", VIBE_EXTENSION))
        || name.ends_with(&format!(".{}", BUNDLE_EXTENSION))
        || name.ends_with(".tmp")
}

/// Write to a temp sibling, then rename over the target
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io("create directory", parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).map_err(|e| StorageError::io("write file", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StorageError::io("rename file", path, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::bundle::{self, BundleItem};
    use crate::test_support::reference;

    #[test]
    fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileStorage::new(dir.path().join("vibes")).unwrap();

        let path = files.write_vibe_file(b"{}").unwrap();
        assert!(path.starts_with(files.vibes_dir()));
        assert_eq!(path.extension().unwrap(), VIBE_EXTENSION);
        assert_eq!(files.read_file(&path).unwrap(), b"{}");

        files.delete_file(&path).unwrap();
        assert!(!path.exists());
        // second delete is a no-op
        files.delete_file(&path).unwrap();
    }

    #[test]
    fn test_named_write_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileStorage::new(dir.path()).unwrap();
        let a = files.write_vibe_file_named("same", b"one").unwrap();
        let b = files.write_vibe_file_named("same", b"two").unwrap();
        assert_eq!(a, b);
        assert_eq!(files.read_file(&b).unwrap(), b"two");
        assert_eq!(files.list_files().unwrap(), vec![a]);
    }

    #[test]
    fn test_bundle_extraction_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileStorage::new(dir.path()).unwrap();
        let items: Vec<BundleItem> = ["x", "y"]
            .iter()
            .map(|n| BundleItem {
                reference: reference(n, &format!("enc-{}", n)),
                preview: Vec::new(),
            })
            .collect();
        let path = files
            .write_bundle_file(&bundle::create("Two", &items).unwrap())
            .unwrap();
        assert!(path.to_string_lossy().ends_with(BUNDLE_EXTENSION));

        let y = files.extract_vibe_from_bundle(&path, 1).unwrap().unwrap();
        assert_eq!(y.display_name, "y");
        assert_eq!(y.bundle_source.as_deref(), Some("Two"));
        assert!(files.extract_vibe_from_bundle(&path, 2).unwrap().is_none());
    }

    #[test]
    fn test_missing_bundle_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileStorage::new(dir.path()).unwrap();
        let err = files
            .extract_vibe_from_bundle(&dir.path().join("gone.naiv4vibebundle"), 0)
            .unwrap_err();
        assert!(matches!(err, StorageError::FileIo { op: "open bundle", .. }));
    }

    #[test]
    fn test_list_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileStorage::new(dir.path()).unwrap();
        fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        fs::write(dir.path().join("half.naiv4vibe.tmp"), b"partial").unwrap();
        let v = files.write_vibe_file(b"{}").unwrap();

        let listed = files.list_files().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&v));
    }
}
