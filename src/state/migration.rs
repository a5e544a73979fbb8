/// Catalog schema migration
///
/// Records are stored as JSON, so a schema change is a transform over the
/// record object plus whatever file layout change goes with it. The table
/// below lists one transform per version step; the `Migrator` drives them
/// under a resumable protocol:
///
/// 1. back up the record (and its file) unless a backup already exists,
///    in which case the backed-up original is used
/// 2. transform the record
/// 3. write it back with the new `schemaVersion` in one statement
/// 4. advance the catalog version once every record reached it
///
/// A record already at or past the step target is skipped, so a retry
/// after a failure never applies a step twice.
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use super::catalog::{Catalog, RawRecord};
use super::data::{VibeEncoding, VibeLibraryEntry, VibeReference, CURRENT_SCHEMA_VERSION};
use super::edit::VibeParams;
use super::files::{write_atomic, FileStorage};
use crate::codec::envelope;
use crate::error::{StorageError, StorageResult};
use crate::preview::content_hash;

/// Persisted control row of the migration driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationState {
    pub schema_version: u32,
    pub in_progress: bool,
    pub target_version: Option<u32>,
    pub backup_dir: Option<PathBuf>,
    pub last_error: Option<String>,
}

impl MigrationState {
    pub fn at_version(schema_version: u32) -> Self {
        Self {
            schema_version,
            in_progress: false,
            target_version: None,
            backup_dir: None,
            last_error: None,
        }
    }
}

/// What a transform may touch besides the record itself
pub struct MigrationContext<'a> {
    pub files: &'a FileStorage,
}

pub type TransformFn = fn(&mut Map<String, Value>, &MigrationContext<'_>) -> Result<(), String>;

/// Transform taking records from `from_version` to `from_version + 1`
#[derive(Clone, Copy)]
pub struct MigrationStep {
    pub from_version: u32,
    pub name: &'static str,
    pub transform: TransformFn,
}

pub static MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        from_version: 1,
        name: "externalize_vibe_files",
        transform: externalize_vibe_files,
    },
    MigrationStep {
        from_version: 2,
        name: "bundle_fields_and_content_hash",
        transform: bundle_fields_and_content_hash,
    },
];

/// v1 -> v2: every single vibe gets its envelope written to
/// `vibes/<id>.naiv4vibe` and the record points at it
fn externalize_vibe_files(record: &mut Map<String, Value>, ctx: &MigrationContext<'_>) -> Result<(), String> {
    let id = record
        .get("id")
        .and_then(Value::as_str)
        .ok_or("record has no id")?
        .to_string();

    // The record carries the same params as the file it points at
    let params = record_params(record);
    record.insert("strength".into(), Value::from(params.strength));
    record.insert("infoExtracted".into(), Value::from(params.info_extracted));

    // Bundles were never stored inline
    let Some(encoding) = record
        .get("vibeEncoding")
        .and_then(Value::as_str)
        .and_then(|e| VibeEncoding::new(e))
    else {
        return Ok(());
    };

    let name = record.get("name").and_then(Value::as_str).unwrap_or(&id).to_string();
    let reference = VibeReference::pre_encoded(name, encoding).with_params(params);
    let json = envelope::encode_to_json(&reference).map_err(|e| e.to_string())?;
    let path = ctx
        .files
        .write_vibe_file_named(&id, json.as_bytes())
        .map_err(|e| e.to_string())?;

    record.insert("filePath".into(), Value::String(path.to_string_lossy().to_string()));
    Ok(())
}

/// Stored params clamped into range, defaults where missing
fn record_params(record: &Map<String, Value>) -> VibeParams {
    let defaults = VibeParams::default();
    VibeParams::new(
        record.get("strength").and_then(Value::as_f64).unwrap_or(defaults.strength),
        record
            .get("infoExtracted")
            .and_then(Value::as_f64)
            .unwrap_or(defaults.info_extracted),
    )
}

/// v2 -> v3: bundle and usage fields get their defaults, and the
/// thumbnail hash used for duplicate detection is computed
fn bundle_fields_and_content_hash(record: &mut Map<String, Value>, _ctx: &MigrationContext<'_>) -> Result<(), String> {
    let id = record
        .get("id")
        .and_then(Value::as_str)
        .ok_or("record has no id")?
        .to_string();
    let params = record_params(record);
    record.entry("name").or_insert(Value::String(id));
    record.entry("strength").or_insert_with(|| Value::from(params.strength));
    record
        .entry("infoExtracted")
        .or_insert_with(|| Value::from(params.info_extracted));
    record.entry("bundleId").or_insert(Value::Null);
    record.entry("bundledVibeNames").or_insert_with(|| Value::Array(Vec::new()));
    record.entry("bundledVibePreviews").or_insert_with(|| Value::Array(Vec::new()));
    record.entry("lastUsedAt").or_insert(Value::Null);
    record.entry("isFavorite").or_insert(Value::Bool(false));
    record.entry("tags").or_insert_with(|| Value::Array(Vec::new()));
    record.entry("usedCount").or_insert_with(|| Value::from(1));
    record
        .entry("createdAt")
        .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));

    let has_hash = record.get("contentHash").map(|h| !h.is_null()).unwrap_or(false);
    if !has_hash {
        if let Some(thumbnail) = record.get("thumbnail").and_then(Value::as_str) {
            let bytes = STANDARD
                .decode(thumbnail)
                .map_err(|e| format!("thumbnail is not base64: {}", e))?;
            record.insert("contentHash".into(), Value::String(content_hash(&bytes)));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Nothing to do
    UpToDate,
    /// Work outstanding or interrupted midway
    Migrating,
    /// This run brought the catalog to the target version
    Completed,
    /// The last attempt failed; rows are at their backed-up state
    FailedRolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub status: MigrationStatus,
    pub from_version: u32,
    pub to_version: u32,
    /// Records transformed during this run
    pub migrated: usize,
    /// Records found already at a step target
    pub skipped: usize,
}

/// Drives the catalog from its stored schema version to `target`
pub struct Migrator<'a> {
    catalog: &'a Catalog,
    files: &'a FileStorage,
    backup_root: PathBuf,
    steps: &'a [MigrationStep],
    target: u32,
}

impl<'a> Migrator<'a> {
    pub fn new(catalog: &'a Catalog, files: &'a FileStorage, backup_root: impl Into<PathBuf>) -> Self {
        Self {
            catalog,
            files,
            backup_root: backup_root.into(),
            steps: MIGRATIONS,
            target: CURRENT_SCHEMA_VERSION,
        }
    }

    /// Swap in a different migration table
    pub fn with_steps(mut self, steps: &'a [MigrationStep], target: u32) -> Self {
        self.steps = steps;
        self.target = target;
        self
    }

    pub fn status(&self) -> StorageResult<MigrationStatus> {
        let state = self.catalog.migration_state()?;
        Ok(if state.in_progress && state.last_error.is_some() {
            MigrationStatus::FailedRolledBack
        } else if state.in_progress || state.schema_version < self.target {
            MigrationStatus::Migrating
        } else {
            MigrationStatus::UpToDate
        })
    }

    /// Run or resume the migration
    pub fn run(&self) -> StorageResult<MigrationReport> {
        let mut state = self.catalog.migration_state()?;
        let from_version = state.schema_version;

        if !state.in_progress && state.schema_version >= self.target {
            return Ok(MigrationReport {
                status: MigrationStatus::UpToDate,
                from_version,
                to_version: state.schema_version,
                migrated: 0,
                skipped: 0,
            });
        }

        if state.in_progress {
            tracing::warn!(
                version = state.schema_version,
                target = ?state.target_version,
                "resuming interrupted catalog migration"
            );
        } else {
            tracing::info!(from = state.schema_version, to = self.target, "🔄 migrating catalog");
        }

        let target = state.target_version.unwrap_or(self.target).max(self.target);
        let backup_root = state.backup_dir.clone().unwrap_or_else(|| self.backup_root.clone());
        state.in_progress = true;
        state.target_version = Some(target);
        state.backup_dir = Some(backup_root.clone());
        self.catalog.save_migration_state(&state)?;

        let ctx = MigrationContext { files: self.files };
        let mut migrated = 0;
        let mut skipped = 0;

        while state.schema_version < target {
            let version = state.schema_version;
            let step = self
                .steps
                .iter()
                .find(|s| s.from_version == version)
                .ok_or_else(|| StorageError::MigrationStepFailed {
                    entry_id: String::new(),
                    reason: format!("no migration registered from version {}", version),
                })?;
            let next = version + 1;
            let step_dir = backup_root.join(format!("v{}", next));

            for record in self.catalog.raw_records()? {
                if record.schema_version >= next {
                    skipped += 1;
                    continue;
                }
                if let Err(e) = self.migrate_record(step, &record, next, &step_dir, &ctx) {
                    tracing::error!(entry = %record.id, step = step.name, error = %e, "migration step failed");
                    state.last_error = Some(e.to_string());
                    self.catalog.save_migration_state(&state)?;
                    return Err(e);
                }
                migrated += 1;
            }

            state.schema_version = next;
            state.last_error = None;
            self.catalog.save_migration_state(&state)?;
            tracing::info!(step = step.name, version = next, "migration step complete");
        }

        // The backup outlives any record this build still cannot load
        if target == CURRENT_SCHEMA_VERSION {
            if let Err(e) = self.check_records_load() {
                tracing::error!(error = %e, "migrated catalog does not load");
                state.last_error = Some(e.to_string());
                self.catalog.save_migration_state(&state)?;
                return Err(e);
            }
        }

        if backup_root.exists() {
            fs::remove_dir_all(&backup_root)
                .map_err(|e| StorageError::io("remove migration backup", &backup_root, e))?;
        }
        let done = MigrationState::at_version(state.schema_version);
        self.catalog.save_migration_state(&done)?;

        tracing::info!(version = done.schema_version, migrated, skipped, "✅ catalog migration complete");
        Ok(MigrationReport {
            status: MigrationStatus::Completed,
            from_version,
            to_version: done.schema_version,
            migrated,
            skipped,
        })
    }

    fn check_records_load(&self) -> StorageResult<()> {
        for RawRecord { id, value, .. } in self.catalog.raw_records()? {
            serde_json::from_value::<VibeLibraryEntry>(value).map_err(|e| StorageError::MigrationStepFailed {
                entry_id: id,
                reason: format!("record does not load after migration: {}", e),
            })?;
        }
        Ok(())
    }

    fn migrate_record(
        &self,
        step: &MigrationStep,
        record: &RawRecord,
        next: u32,
        step_dir: &Path,
        ctx: &MigrationContext<'_>,
    ) -> StorageResult<()> {
        let original = self.backup_record(record, step_dir)?;

        let failed = |reason: String| StorageError::MigrationStepFailed {
            entry_id: record.id.clone(),
            reason,
        };

        let Value::Object(mut object) = original else {
            return Err(failed("record is not a JSON object".into()));
        };
        (step.transform)(&mut object, ctx).map_err(failed)?;
        object.insert("schemaVersion".into(), Value::from(next));

        self.catalog.write_raw_record(&record.id, next, &Value::Object(object))
    }

    /// Back up the record and its file, or return the earlier backup
    fn backup_record(&self, record: &RawRecord, step_dir: &Path) -> StorageResult<Value> {
        let json_path = step_dir.join(format!("{}.json", record.id));
        if json_path.exists() {
            let text = fs::read(&json_path).map_err(|e| StorageError::io("read migration backup", &json_path, e))?;
            return Ok(serde_json::from_slice(&text)?);
        }

        if let Some(file) = record.value.get("filePath").and_then(Value::as_str).map(Path::new) {
            if file.exists() {
                self.files.copy_into(file, &step_dir.join(format!("{}.file", record.id)))?;
            }
        }
        write_atomic(&json_path, &serde_json::to_vec(&record.value)?)?;
        Ok(record.value.clone())
    }
}
