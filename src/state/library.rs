use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::catalog::Catalog;
use super::data::{VibeEncoding, VibeLibraryEntry, VibeReference, CURRENT_SCHEMA_VERSION};
use super::edit::VibeParams;
use super::files::FileStorage;
use super::migration::{MigrationReport, Migrator};
use crate::codec::{bundle, envelope};
use crate::config::LibraryConfig;
use crate::error::{CodecError, StorageError, StorageResult};
use crate::preview::thumbnail::{cache_thumbnail, content_hash, evict_thumbnail};

/// What to do when a different vibe already uses the name being saved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Leave the existing entry alone and save nothing
    Skip,
    /// Replace the existing entry, keeping its id
    Overwrite,
    /// Save under "<name> (2)", "<name> (3)", ...
    KeepBoth,
}

/// Result of a save, carrying the id of the entry that now represents the vibe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Created(String),
    /// Same vibe already saved; its usage count was bumped instead
    Duplicate(String),
    /// Name conflict resolved by skipping
    Skipped(String),
    Overwritten(String),
}

impl SaveOutcome {
    pub fn id(&self) -> &str {
        match self {
            SaveOutcome::Created(id)
            | SaveOutcome::Duplicate(id)
            | SaveOutcome::Skipped(id)
            | SaveOutcome::Overwritten(id) => id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryStats {
    pub entries: usize,
    pub bundles: usize,
    pub favorites: usize,
    pub total_uses: u64,
    /// Bytes of vibe and bundle files on disk
    pub file_bytes: u64,
}

/// The VibeLibrary is the authoritative store of saved vibes.
///
/// It owns the catalog index and the file store and keeps them in step:
/// a save writes the file before the index record, a delete removes the
/// file before the index record. A crash in between can only leave an
/// orphan file, which `sweep_orphans` reclaims.
///
/// All mutations are serialized by one write lock; reads go through their
/// own catalog connection and never wait on it.
pub struct VibeLibrary {
    config: LibraryConfig,
    catalog: Catalog,
    files: FileStorage,
    write_lock: Mutex<()>,
    migration: MigrationReport,
}

impl VibeLibrary {
    /// Open the library, bringing the catalog to the current schema first.
    ///
    /// Refuses to open while a migration cannot complete.
    pub fn open(config: LibraryConfig) -> StorageResult<Self> {
        let catalog = Catalog::open(config.catalog_path())?;
        let files = FileStorage::new(config.vibes_dir())?;

        let migration = Migrator::new(&catalog, &files, config.backup_root()).run()?;
        let state = catalog.migration_state()?;
        if state.in_progress || state.schema_version < CURRENT_SCHEMA_VERSION {
            return Err(StorageError::MigrationPending);
        }

        let library = Self {
            config,
            catalog,
            files,
            write_lock: Mutex::new(()),
            migration,
        };
        library.verify_files()?;

        tracing::info!(
            path = %library.config.data_dir.display(),
            catalog = %library.catalog.path().display(),
            entries = library.catalog.entry_count()?,
            "📚 vibe library opened"
        );
        Ok(library)
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    /// What the migrator did while opening
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Upsert a fully formed record. The file it points at must exist.
    pub fn save_entry(&self, entry: &VibeLibraryEntry) -> StorageResult<()> {
        if !entry.params().is_valid() {
            return Err(CodecError::InvalidPayload(format!(
                "strength {} / infoExtracted {} outside 0..=1",
                entry.strength, entry.info_extracted
            ))
            .into());
        }
        let path = entry.file_path.clone().unwrap_or_default();
        if !path.is_file() {
            return Err(StorageError::io(
                "save entry",
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "entry has no backing file"),
            ));
        }

        let mut entry = entry.clone();
        entry.schema_version = CURRENT_SCHEMA_VERSION;

        let _guard = self.lock();
        self.catalog.upsert_entry(&entry)?;
        tracing::debug!(id = %entry.id, name = %entry.name, "saved entry");
        Ok(())
    }

    /// Save an encoded reference as a single-vibe entry.
    /// `thumbnail` is a preview of the vibe's source image.
    pub fn save_reference(
        &self,
        reference: &VibeReference,
        thumbnail: Option<Vec<u8>>,
        on_conflict: ConflictResolution,
    ) -> StorageResult<SaveOutcome> {
        self.save_single(reference, thumbnail, true, on_conflict)
    }

    /// Save a reference pulled out of a PNG. The thumbnail shows the host
    /// image, which can carry any vibe, so only the encoding identifies it.
    pub fn save_embedded_reference(
        &self,
        reference: &VibeReference,
        host_thumbnail: Option<Vec<u8>>,
        on_conflict: ConflictResolution,
    ) -> StorageResult<SaveOutcome> {
        self.save_single(reference, host_thumbnail, false, on_conflict)
    }

    fn save_single(
        &self,
        reference: &VibeReference,
        thumbnail: Option<Vec<u8>>,
        hash_thumbnail: bool,
        on_conflict: ConflictResolution,
    ) -> StorageResult<SaveOutcome> {
        let encoding = reference.vibe_encoding().ok_or_else(|| {
            CodecError::EncodingFailed(format!("'{}' must be encoded before saving", reference.display_name))
        })?;

        let mut entry = VibeLibraryEntry::new(reference.display_name.trim(), reference.params().clamped());
        entry.vibe_encoding = Some(encoding.as_str().to_string());
        if hash_thumbnail {
            entry.content_hash = thumbnail.as_deref().map(content_hash);
        }
        entry.thumbnail = thumbnail;

        self.store(entry, on_conflict, |files, entry| {
            let mut named = reference.clone();
            named.display_name = entry.name.clone();
            named.set_params(entry.params());
            let json = envelope::encode_to_json(&named)?;
            files.write_vibe_file(json.as_bytes())
        })
    }

    /// Save a bundle file as one entry listing its items
    pub fn save_bundle(
        &self,
        name: &str,
        bundle_bytes: &[u8],
        on_conflict: ConflictResolution,
    ) -> StorageResult<SaveOutcome> {
        let names = bundle::item_names(bundle_bytes)?;
        if names.is_empty() {
            return Err(CodecError::MalformedBundle("bundle has no items".into()).into());
        }
        let previews = (0..names.len())
            .map(|i| bundle::preview_at(bundle_bytes, i).map(Option::unwrap_or_default))
            .collect::<Result<Vec<_>, _>>()?;

        let mut entry = VibeLibraryEntry::new(name.trim(), VibeParams::default());
        entry.bundle_id = Some(uuid::Uuid::new_v4().to_string());
        entry.content_hash = Some(content_hash(bundle_bytes));
        entry.thumbnail = previews.iter().find(|p| !p.is_empty()).cloned();
        entry.bundled_vibe_names = names;
        entry.bundled_vibe_previews = previews;

        self.store(entry, on_conflict, |files, _| files.write_bundle_file(bundle_bytes))
    }

    /// Shared save path: dedup, resolve name conflicts, then file before index
    fn store(
        &self,
        mut entry: VibeLibraryEntry,
        on_conflict: ConflictResolution,
        write_file: impl FnOnce(&FileStorage, &VibeLibraryEntry) -> StorageResult<PathBuf>,
    ) -> StorageResult<SaveOutcome> {
        let _guard = self.lock();
        let existing = self.catalog.all_entries()?;

        if let Some(dup) = find_duplicate(&existing, &entry) {
            let id = dup.id.clone();
            self.catalog.increment_used_count(&id, Utc::now())?;
            tracing::info!(id = %id, name = %dup.name, "vibe already in library, bumped usage");
            return Ok(SaveOutcome::Duplicate(id));
        }

        let mut replaced = None;
        if let Some(clash) = existing.iter().find(|e| e.name == entry.name) {
            match on_conflict {
                ConflictResolution::Skip => {
                    tracing::info!(name = %entry.name, "name already used, skipping");
                    return Ok(SaveOutcome::Skipped(clash.id.clone()));
                }
                ConflictResolution::Overwrite => {
                    entry.id = clash.id.clone();
                    entry.created_at = clash.created_at;
                    replaced = Some(clash.clone());
                }
                ConflictResolution::KeepBoth => {
                    entry.name = unique_name(&entry.name, &existing);
                }
            }
        }

        let path = write_file(&self.files, &entry)?;
        entry.file_path = Some(path.clone());

        let indexed = match replaced {
            Some(_) => self.catalog.upsert_entry(&entry),
            None => self.catalog.insert_entry(&entry),
        };
        if let Err(e) = indexed {
            tracing::error!(name = %entry.name, error = %e, "index write failed, discarding new file");
            if let Err(cleanup) = self.files.delete_file(&path) {
                tracing::warn!(path = %path.display(), error = %cleanup, "could not discard file; sweep will reclaim it");
            }
            return Err(e);
        }

        if let Some(thumb) = &entry.thumbnail {
            if let Err(e) = cache_thumbnail(&self.config.thumbnail_cache_dir(), &entry.id, thumb) {
                tracing::warn!(id = %entry.id, error = %e, "could not cache thumbnail");
            }
        }

        match replaced {
            Some(old) => {
                if let Some(old_path) = old.file_path.filter(|p| *p != path) {
                    if let Err(e) = self.files.delete_file(&old_path) {
                        tracing::warn!(path = %old_path.display(), error = %e, "could not remove replaced file");
                    }
                }
                tracing::info!(id = %entry.id, name = %entry.name, "💾 overwrote vibe");
                Ok(SaveOutcome::Overwritten(entry.id))
            }
            None => {
                tracing::info!(id = %entry.id, name = %entry.name, "💾 saved vibe");
                Ok(SaveOutcome::Created(entry.id))
            }
        }
    }

    /// All entries, newest first
    pub fn get_all_entries(&self) -> StorageResult<Vec<VibeLibraryEntry>> {
        self.catalog.all_entries()
    }

    pub fn get_entry(&self, id: &str) -> StorageResult<Option<VibeLibraryEntry>> {
        self.catalog.get_entry(id)
    }

    fn require_entry(&self, id: &str) -> StorageResult<VibeLibraryEntry> {
        self.catalog
            .get_entry(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    /// Remove an entry: file first, then the index record
    pub fn delete_entry(&self, id: &str) -> StorageResult<()> {
        let _guard = self.lock();
        let entry = self.require_entry(id)?;

        if let Some(path) = &entry.file_path {
            self.files.delete_file(path)?;
        }
        self.catalog.delete_entry(id)?;

        if let Err(e) = evict_thumbnail(&self.config.thumbnail_cache_dir(), id) {
            tracing::warn!(id, error = %e, "could not evict cached thumbnail");
        }
        tracing::info!(id, name = %entry.name, "🗑️ deleted vibe");
        Ok(())
    }

    pub fn increment_used_count(&self, id: &str) -> StorageResult<VibeLibraryEntry> {
        let _guard = self.lock();
        self.catalog
            .increment_used_count(id, Utc::now())?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    /// Rebuild the usable reference of a single-vibe entry.
    /// Name and parameters come from the record, which edits keep current.
    pub fn load_reference(&self, id: &str) -> StorageResult<VibeReference> {
        let entry = self.require_entry(id)?;
        if entry.is_bundle() {
            return Err(CodecError::InvalidPayload(format!(
                "'{}' is a bundle; extract one of its {} vibes",
                entry.name,
                entry.bundled_vibe_count()
            ))
            .into());
        }

        let mut reference = match &entry.file_path {
            Some(path) => {
                let bytes = self.files.read_file(path)?;
                envelope::decode(&String::from_utf8_lossy(&bytes))?
            }
            None => {
                let encoding = entry
                    .vibe_encoding
                    .clone()
                    .and_then(VibeEncoding::new)
                    .ok_or_else(|| CodecError::InvalidPayload("entry has no vibe encoding".into()))?;
                VibeReference::pre_encoded(entry.name.clone(), encoding)
            }
        };
        reference.display_name = entry.name.clone();
        reference.set_params(entry.params());
        Ok(reference)
    }

    /// Read one vibe of a bundle entry without loading the others
    pub fn extract_from_bundle(&self, id: &str, index: usize) -> StorageResult<Option<VibeReference>> {
        let entry = self.require_entry(id)?;
        let path = match (&entry.file_path, entry.is_bundle()) {
            (Some(path), true) => path,
            _ => {
                return Err(CodecError::MalformedBundle(format!("'{}' is not a bundle", entry.name)).into());
            }
        };
        self.files.extract_vibe_from_bundle(path, index)
    }

    /// Rename an entry; a name held by a different entry is refused
    pub fn rename_entry(&self, id: &str, name: &str) -> StorageResult<VibeLibraryEntry> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CodecError::InvalidPayload("name must not be empty".into()).into());
        }

        let _guard = self.lock();
        let mut entry = self.require_entry(id)?;
        if let Some(clash) = self.catalog.all_entries()?.iter().find(|e| e.name == name && e.id != id) {
            tracing::info!(id, clash = %clash.id, name, "rename refused, name already used");
            return Err(StorageError::NameTaken(name.to_string()));
        }
        entry.name = name.to_string();
        self.catalog.update_entry(&entry)?;
        Ok(entry)
    }

    pub fn update_params(&self, id: &str, params: VibeParams) -> StorageResult<VibeLibraryEntry> {
        let params = params.clamped();
        self.edit(id, |entry| {
            entry.strength = params.strength;
            entry.info_extracted = params.info_extracted;
        })
    }

    pub fn set_favorite(&self, id: &str, favorite: bool) -> StorageResult<VibeLibraryEntry> {
        self.edit(id, |entry| entry.is_favorite = favorite)
    }

    fn edit(&self, id: &str, apply: impl FnOnce(&mut VibeLibraryEntry)) -> StorageResult<VibeLibraryEntry> {
        let _guard = self.lock();
        let mut entry = self.require_entry(id)?;
        apply(&mut entry);
        self.catalog.update_entry(&entry)?;
        Ok(entry)
    }

    pub fn stats(&self) -> StorageResult<LibraryStats> {
        let entries = self.catalog.all_entries()?;
        let file_bytes = entries
            .iter()
            .filter_map(|e| e.file_path.as_deref())
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();

        Ok(LibraryStats {
            entries: entries.len(),
            bundles: entries.iter().filter(|e| e.is_bundle()).count(),
            favorites: entries.iter().filter(|e| e.is_favorite).count(),
            total_uses: entries.iter().map(|e| u64::from(e.used_count)).sum(),
            file_bytes,
        })
    }

    /// Delete every entry and its file; returns how many entries were removed
    pub fn clear_all(&self) -> StorageResult<usize> {
        let _guard = self.lock();
        for entry in self.catalog.all_entries()? {
            if let Some(path) = &entry.file_path {
                self.files.delete_file(path)?;
            }
        }
        let removed = self.catalog.clear()?;

        let cache = self.config.thumbnail_cache_dir();
        if cache.exists() {
            if let Err(e) = std::fs::remove_dir_all(&cache) {
                tracing::warn!(path = %cache.display(), error = %e, "could not clear thumbnail cache");
            }
        }
        tracing::info!(removed, "🧹 library cleared");
        Ok(removed)
    }

    /// Delete files under the vibes directory that no entry points at,
    /// including temp files left by an interrupted write
    pub fn sweep_orphans(&self) -> StorageResult<Vec<PathBuf>> {
        let _guard = self.lock();
        let referenced: HashSet<PathBuf> = self
            .catalog
            .all_entries()?
            .into_iter()
            .filter_map(|e| e.file_path)
            .collect();

        let mut removed = Vec::new();
        for path in self.files.list_files()? {
            if !referenced.contains(&path) {
                self.files.delete_file(&path)?;
                removed.push(path);
            }
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "🧹 removed orphan files");
        }
        Ok(removed)
    }

    /// Drop index records whose backing file has disappeared.
    /// Returns how many were dropped.
    pub fn verify_files(&self) -> StorageResult<usize> {
        let _guard = self.lock();
        let mut dropped = 0;
        for entry in self.catalog.all_entries()? {
            let missing = entry.file_path.as_deref().map(|p| !p.exists()).unwrap_or(false);
            if missing {
                self.catalog.delete_entry(&entry.id)?;
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::warn!(dropped, "⚠️ dropped entries whose files are missing");
        }
        Ok(dropped)
    }

    /// Flush the catalog and release the library
    pub fn close(self) -> StorageResult<()> {
        let _guard = self.lock();
        self.catalog.checkpoint()?;
        tracing::info!(path = %self.config.data_dir.display(), "vibe library closed");
        Ok(())
    }

    pub fn vibes_dir(&self) -> &Path {
        self.files.vibes_dir()
    }
}

/// Same encoding first, then same content hash
fn find_duplicate<'a>(existing: &'a [VibeLibraryEntry], entry: &VibeLibraryEntry) -> Option<&'a VibeLibraryEntry> {
    let by_encoding = entry
        .vibe_encoding
        .as_ref()
        .and_then(|enc| existing.iter().find(|e| e.vibe_encoding.as_ref() == Some(enc)));

    by_encoding.or_else(|| {
        entry
            .content_hash
            .as_ref()
            .and_then(|hash| existing.iter().find(|e| e.content_hash.as_ref() == Some(hash)))
    })
}

fn unique_name(name: &str, existing: &[VibeLibraryEntry]) -> String {
    let taken: HashSet<&str> = existing.iter().map(|e| e.name.as_str()).collect();
    (2..)
        .map(|n| format!("{} ({})", name, n))
        .find(|candidate| !taken.contains(candidate.as_str()))
        .unwrap_or_else(|| format!("{} ({})", name, uuid::Uuid::new_v4()))
}

impl std::fmt::Debug for VibeLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VibeLibrary")
            .field("data_dir", &self.config.data_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::bundle::BundleItem;
    use crate::codec::png;
    use crate::test_support::{other_png, reference, sample_png, sunset_envelope};
    use rusqlite::Connection;

    fn open_temp() -> (tempfile::TempDir, VibeLibrary) {
        let dir = tempfile::tempdir().unwrap();
        let library = VibeLibrary::open(LibraryConfig::at(dir.path())).unwrap();
        (dir, library)
    }

    /// Install a trigger through a second connection so the library's own
    /// statement fails
    fn inject_failure(library: &VibeLibrary, sql: &str) {
        let conn = Connection::open(library.config().catalog_path()).unwrap();
        conn.execute_batch(sql).unwrap();
    }

    #[test]
    fn test_save_and_load_reference() {
        let (_dir, library) = open_temp();
        let thumb = sample_png(8, 8);
        let outcome = library
            .save_reference(&reference("Sunset", "AQID"), Some(thumb.clone()), ConflictResolution::KeepBoth)
            .unwrap();
        assert!(matches!(outcome, SaveOutcome::Created(_)));

        let entry = library.get_entry(outcome.id()).unwrap().unwrap();
        assert_eq!(entry.used_count, 1);
        assert_eq!(entry.thumbnail, Some(thumb.clone()));
        assert_eq!(entry.content_hash, Some(content_hash(&thumb)));
        assert!(entry.file_path.as_ref().unwrap().starts_with(library.vibes_dir()));

        let loaded = library.load_reference(outcome.id()).unwrap();
        assert_eq!(loaded.display_name, "Sunset");
        assert_eq!(loaded.vibe_encoding().unwrap().as_str(), "AQID");
        assert_eq!(loaded.params(), VibeParams::new(0.5, 0.8));
    }

    #[test]
    fn test_same_vibe_twice_counts_usage() {
        let (_dir, library) = open_temp();
        let vibe = reference("Sunset", "AQID");
        let first = library.save_reference(&vibe, None, ConflictResolution::KeepBoth).unwrap();
        let second = library.save_reference(&vibe, None, ConflictResolution::KeepBoth).unwrap();

        assert_eq!(second, SaveOutcome::Duplicate(first.id().to_string()));
        let entries = library.get_all_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].used_count, 2);
        assert!(entries[0].last_used_at.is_some());
    }

    #[test]
    fn test_duplicate_by_thumbnail_hash() {
        let (_dir, library) = open_temp();
        let thumb = sample_png(8, 8);
        let first = library
            .save_reference(&reference("a", "enc-a"), Some(thumb.clone()), ConflictResolution::KeepBoth)
            .unwrap();
        let second = library
            .save_reference(&reference("b", "enc-b"), Some(thumb), ConflictResolution::KeepBoth)
            .unwrap();
        assert_eq!(second, SaveOutcome::Duplicate(first.id().to_string()));

        let third = library
            .save_reference(&reference("c", "enc-c"), Some(other_png(8, 8)), ConflictResolution::KeepBoth)
            .unwrap();
        assert!(matches!(third, SaveOutcome::Created(_)));
    }

    #[test]
    fn test_embedded_vibes_sharing_a_host_are_distinct() {
        let (_dir, library) = open_temp();
        let host = sample_png(8, 8);
        let first = library
            .save_embedded_reference(&reference("Sunset", "enc-a"), Some(host.clone()), ConflictResolution::KeepBoth)
            .unwrap();
        let second = library
            .save_embedded_reference(&reference("Forest", "enc-b"), Some(host.clone()), ConflictResolution::KeepBoth)
            .unwrap();
        assert!(matches!(first, SaveOutcome::Created(_)));
        assert!(matches!(second, SaveOutcome::Created(_)));

        let entry = library.get_entry(second.id()).unwrap().unwrap();
        assert_eq!(entry.thumbnail, Some(host));
        assert!(entry.content_hash.is_none());

        let again = library
            .save_embedded_reference(&reference("Sunset", "enc-a"), None, ConflictResolution::KeepBoth)
            .unwrap();
        assert_eq!(again, SaveOutcome::Duplicate(first.id().to_string()));
    }

    #[test]
    fn test_raw_reference_must_be_encoded() {
        let (_dir, library) = open_temp();
        let raw = VibeReference::raw_image("cat", sample_png(4, 4));
        let err = library.save_reference(&raw, None, ConflictResolution::KeepBoth).unwrap_err();
        assert!(matches!(err, StorageError::Codec(CodecError::EncodingFailed(_))));
        assert!(library.get_all_entries().unwrap().is_empty());
    }

    #[test]
    fn test_name_conflicts() {
        let (_dir, library) = open_temp();
        let first = library
            .save_reference(&reference("Sunset", "one"), None, ConflictResolution::KeepBoth)
            .unwrap();

        let skipped = library
            .save_reference(&reference("Sunset", "two"), None, ConflictResolution::Skip)
            .unwrap();
        assert_eq!(skipped, SaveOutcome::Skipped(first.id().to_string()));
        assert_eq!(library.get_all_entries().unwrap().len(), 1);

        let kept = library
            .save_reference(&reference("Sunset", "two"), None, ConflictResolution::KeepBoth)
            .unwrap();
        assert_eq!(library.get_entry(kept.id()).unwrap().unwrap().name, "Sunset (2)");
        let third = library
            .save_reference(&reference("Sunset", "three"), None, ConflictResolution::KeepBoth)
            .unwrap();
        assert_eq!(library.get_entry(third.id()).unwrap().unwrap().name, "Sunset (3)");

        let old_path = library.get_entry(first.id()).unwrap().unwrap().file_path.unwrap();
        let over = library
            .save_reference(&reference("Sunset", "four"), None, ConflictResolution::Overwrite)
            .unwrap();
        assert_eq!(over, SaveOutcome::Overwritten(first.id().to_string()));
        assert!(!old_path.exists());
        let loaded = library.load_reference(first.id()).unwrap();
        assert_eq!(loaded.vibe_encoding().unwrap().as_str(), "four");
        assert_eq!(library.get_all_entries().unwrap().len(), 3);
    }

    #[test]
    fn test_index_failure_leaves_no_file() {
        let (_dir, library) = open_temp();
        inject_failure(
            &library,
            "CREATE TRIGGER fail_insert BEFORE INSERT ON vibe_entries
             BEGIN SELECT RAISE(ABORT, 'injected'); END;",
        );

        let err = library
            .save_reference(&reference("Sunset", "AQID"), None, ConflictResolution::KeepBoth)
            .unwrap_err();
        assert!(matches!(err, StorageError::Catalog(_)));
        assert!(library.get_all_entries().unwrap().is_empty());
        assert!(library.files.list_files().unwrap().is_empty());
    }

    #[test]
    fn test_delete_removes_file_before_record() {
        let dir = tempfile::tempdir().unwrap();
        let library = VibeLibrary::open(LibraryConfig::at(dir.path())).unwrap();
        let id = library
            .save_reference(&reference("a", "enc"), Some(sample_png(4, 4)), ConflictResolution::KeepBoth)
            .unwrap()
            .id()
            .to_string();
        let path = library.get_entry(&id).unwrap().unwrap().file_path.unwrap();

        inject_failure(
            &library,
            "CREATE TRIGGER fail_delete BEFORE DELETE ON vibe_entries
             BEGIN SELECT RAISE(ABORT, 'injected'); END;",
        );
        assert!(library.delete_entry(&id).is_err());
        // file already gone, record still there
        assert!(!path.exists());
        assert!(library.get_entry(&id).unwrap().is_some());

        inject_failure(&library, "DROP TRIGGER fail_delete;");
        library.close().unwrap();

        // reopening drops the record whose file is missing
        let library = VibeLibrary::open(LibraryConfig::at(dir.path())).unwrap();
        assert!(library.get_entry(&id).unwrap().is_none());
    }

    #[test]
    fn test_delete_entry() {
        let (_dir, library) = open_temp();
        let id = library
            .save_reference(&reference("a", "enc"), Some(sample_png(4, 4)), ConflictResolution::KeepBoth)
            .unwrap()
            .id()
            .to_string();
        let path = library.get_entry(&id).unwrap().unwrap().file_path.unwrap();

        library.delete_entry(&id).unwrap();
        assert!(!path.exists());
        assert!(library.get_entry(&id).unwrap().is_none());
        assert!(matches!(library.delete_entry(&id), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_bundle_save_and_extract() {
        let (_dir, library) = open_temp();
        let items = vec![
            BundleItem {
                reference: reference("x", "enc-x"),
                preview: sample_png(4, 4),
            },
            BundleItem {
                reference: reference("y", "enc-y"),
                preview: Vec::new(),
            },
        ];
        let bytes = bundle::create("Pack", &items).unwrap();

        let id = library
            .save_bundle("Pack", &bytes, ConflictResolution::KeepBoth)
            .unwrap()
            .id()
            .to_string();
        let entry = library.get_entry(&id).unwrap().unwrap();
        assert!(entry.is_bundle());
        assert_eq!(entry.bundled_vibe_names, vec!["x", "y"]);
        assert_eq!(entry.thumbnail, Some(sample_png(4, 4)));

        let y = library.extract_from_bundle(&id, 1).unwrap().unwrap();
        assert_eq!(y.vibe_encoding().unwrap().as_str(), "enc-y");
        assert_eq!(y.bundle_source.as_deref(), Some("Pack"));
        assert!(library.extract_from_bundle(&id, 2).unwrap().is_none());
        assert!(library.load_reference(&id).is_err());

        let again = library.save_bundle("Other", &bytes, ConflictResolution::KeepBoth).unwrap();
        assert_eq!(again, SaveOutcome::Duplicate(id));
    }

    #[test]
    fn test_edits() {
        let (_dir, library) = open_temp();
        let id = library
            .save_reference(&reference("a", "enc"), None, ConflictResolution::KeepBoth)
            .unwrap()
            .id()
            .to_string();

        library.rename_entry(&id, "  Renamed ").unwrap();
        library.update_params(&id, VibeParams::new(0.9, 0.1)).unwrap();
        library.set_favorite(&id, true).unwrap();
        assert!(library.rename_entry(&id, " ").is_err());

        let loaded = library.load_reference(&id).unwrap();
        assert_eq!(loaded.display_name, "Renamed");
        assert_eq!(loaded.params(), VibeParams::new(0.9, 0.1));

        let stats = library.stats().unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.favorites, 1);
        assert!(stats.file_bytes > 0);
        assert!(matches!(library.increment_used_count("nope"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_rename_to_taken_name_is_refused() {
        let (_dir, library) = open_temp();
        let a = library
            .save_reference(&reference("Sunset", "enc-a"), None, ConflictResolution::KeepBoth)
            .unwrap();
        let b = library
            .save_reference(&reference("Forest", "enc-b"), None, ConflictResolution::KeepBoth)
            .unwrap();

        let err = library.rename_entry(b.id(), " Sunset ").unwrap_err();
        assert!(matches!(err, StorageError::NameTaken(ref name) if name == "Sunset"));
        assert_eq!(library.get_entry(b.id()).unwrap().unwrap().name, "Forest");

        // same name on the same entry is a no-op rename
        library.rename_entry(a.id(), "Sunset").unwrap();
        assert!(matches!(library.rename_entry("nope", "Dusk"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_minimal_legacy_record_opens_every_time() {
        let dir = tempfile::tempdir().unwrap();
        let config = LibraryConfig::at(dir.path());
        {
            let catalog = Catalog::open(config.catalog_path()).unwrap();
            catalog
                .insert_raw_record(
                    "legacy",
                    1,
                    &serde_json::json!({"id": "legacy", "name": "Old", "schemaVersion": 1, "vibeEncoding": "AQID"}),
                )
                .unwrap();
        }

        for _ in 0..2 {
            let library = VibeLibrary::open(config.clone()).unwrap();
            let loaded = library.load_reference("legacy").unwrap();
            assert_eq!(loaded.display_name, "Old");
            assert_eq!(loaded.vibe_encoding().unwrap().as_str(), "AQID");
            assert_eq!(loaded.params(), VibeParams::default());
            library.close().unwrap();
        }
        assert!(!config.backup_root().exists());
    }

    #[test]
    fn test_save_entry_requires_file() {
        let (_dir, library) = open_temp();
        let mut entry = VibeLibraryEntry::new("manual", VibeParams::default());
        assert!(matches!(library.save_entry(&entry), Err(StorageError::FileIo { .. })));

        let path = library.files.write_vibe_file(b"{}").unwrap();
        entry.file_path = Some(path);
        library.save_entry(&entry).unwrap();
        entry.used_count = 7;
        library.save_entry(&entry).unwrap();
        assert_eq!(library.get_entry(&entry.id).unwrap().unwrap().used_count, 7);
    }

    #[test]
    fn test_sweep_and_clear() {
        let (_dir, library) = open_temp();
        library
            .save_reference(&reference("keep", "enc"), None, ConflictResolution::KeepBoth)
            .unwrap();
        let stray = library.files.write_vibe_file(b"orphan").unwrap();
        let tmp = library.vibes_dir().join("half.naiv4vibe.tmp");
        std::fs::write(&tmp, b"partial").unwrap();

        let removed = library.sweep_orphans().unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!stray.exists() && !tmp.exists());
        assert_eq!(library.files.list_files().unwrap().len(), 1);

        assert_eq!(library.clear_all().unwrap(), 1);
        assert!(library.get_all_entries().unwrap().is_empty());
        assert!(library.files.list_files().unwrap().is_empty());
    }

    #[test]
    fn test_sunset_through_library() {
        let (_dir, library) = open_temp();
        let image = png::embed(&sample_png(32, 32), &sunset_envelope()).unwrap();
        let vibe = png::extract_reference(&image).unwrap().unwrap();

        let id = library
            .save_reference(&vibe, None, ConflictResolution::KeepBoth)
            .unwrap()
            .id()
            .to_string();
        let loaded = library.load_reference(&id).unwrap();
        assert_eq!(loaded.display_name, "Sunset");
        assert_eq!(loaded.strength, 0.7);
        assert_eq!(loaded.info_extracted, 0.3);

        let shared = envelope::encode_to_base64(&loaded).unwrap();
        assert!(envelope::is_vibe_encoding(&shared));
        assert_eq!(envelope::decode(&shared).unwrap().vibe_encoding(), vibe.vibe_encoding());
    }
}
