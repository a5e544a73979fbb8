use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::data::{VibeLibraryEntry, CURRENT_SCHEMA_VERSION};
use super::migration::MigrationState;
use crate::error::{StorageError, StorageResult};

/// A catalog row before it is interpreted as a current-version entry
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub id: String,
    pub schema_version: u32,
    pub value: Value,
}

/// The Catalog manages the SQLite index of saved vibes.
/// Each row holds the JSON record of one entry plus the columns needed to
/// order and look it up, and one control row tracks schema migration.
pub struct Catalog {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Catalog {
    /// Open or create the catalog at `db_path`
    pub fn open(db_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let db_path = db_path.into();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::io("create catalog directory", parent, e))?;
        }

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        init_schema(&conn)?;

        tracing::info!(path = %db_path.display(), "📁 catalog opened");

        Ok(Catalog {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// Get the path to the database file
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn writer(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves SQLite itself consistent
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fresh read-only connection; WAL gives it a consistent snapshot
    /// while the writer keeps going
    fn reader(&self) -> StorageResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(conn)
    }

    pub fn entry_count(&self) -> StorageResult<usize> {
        let count: i64 = self
            .reader()?
            .query_row("SELECT COUNT(*) FROM vibe_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// All entries, newest first
    pub fn all_entries(&self) -> StorageResult<Vec<VibeLibraryEntry>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT record FROM vibe_entries ORDER BY created_at DESC, id ASC",
        )?;
        let records = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        records
            .iter()
            .map(|json| serde_json::from_str(json).map_err(StorageError::from))
            .collect()
    }

    pub fn get_entry(&self, id: &str) -> StorageResult<Option<VibeLibraryEntry>> {
        let record: Option<String> = self
            .reader()?
            .query_row(
                "SELECT record FROM vibe_entries WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(record.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    pub fn insert_entry(&self, entry: &VibeLibraryEntry) -> StorageResult<()> {
        let record = serde_json::to_string(entry)?;
        self.writer().execute(
            "INSERT INTO vibe_entries (id, name, schema_version, created_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id,
                entry.name,
                entry.schema_version,
                entry.created_at.timestamp_millis(),
                record
            ],
        )?;
        Ok(())
    }

    /// Replace an existing record; returns false if there was none
    pub fn update_entry(&self, entry: &VibeLibraryEntry) -> StorageResult<bool> {
        let record = serde_json::to_string(entry)?;
        let changed = self.writer().execute(
            "UPDATE vibe_entries
             SET name = ?2, schema_version = ?3, created_at = ?4, record = ?5
             WHERE id = ?1",
            params![
                entry.id,
                entry.name,
                entry.schema_version,
                entry.created_at.timestamp_millis(),
                record
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn upsert_entry(&self, entry: &VibeLibraryEntry) -> StorageResult<()> {
        let record = serde_json::to_string(entry)?;
        self.writer().execute(
            "INSERT INTO vibe_entries (id, name, schema_version, created_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                schema_version = excluded.schema_version,
                created_at = excluded.created_at,
                record = excluded.record",
            params![
                entry.id,
                entry.name,
                entry.schema_version,
                entry.created_at.timestamp_millis(),
                record
            ],
        )?;
        Ok(())
    }

    /// Returns false if no such entry existed
    pub fn delete_entry(&self, id: &str) -> StorageResult<bool> {
        let changed = self
            .writer()
            .execute("DELETE FROM vibe_entries WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    /// Bump the usage counter inside one transaction
    pub fn increment_used_count(&self, id: &str, at: DateTime<Utc>) -> StorageResult<Option<VibeLibraryEntry>> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;

        let record: Option<String> = tx
            .query_row("SELECT record FROM vibe_entries WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        let Some(record) = record else {
            return Ok(None);
        };

        let mut entry: VibeLibraryEntry = serde_json::from_str(&record)?;
        entry.used_count = entry.used_count.saturating_add(1);
        entry.last_used_at = Some(at);

        tx.execute(
            "UPDATE vibe_entries SET record = ?2 WHERE id = ?1",
            params![id, serde_json::to_string(&entry)?],
        )?;
        tx.commit()?;
        Ok(Some(entry))
    }

    /// Rows in id order with their stored schema version, uninterpreted
    pub fn raw_records(&self) -> StorageResult<Vec<RawRecord>> {
        let conn = self.writer();
        let mut stmt = conn.prepare("SELECT id, schema_version, record FROM vibe_entries ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, schema_version, json)| {
                Ok(RawRecord {
                    id,
                    schema_version,
                    value: serde_json::from_str(&json)?,
                })
            })
            .collect()
    }

    /// Store a record at `schema_version` in a single statement
    pub fn write_raw_record(&self, id: &str, schema_version: u32, value: &Value) -> StorageResult<()> {
        let name = value.get("name").and_then(Value::as_str).unwrap_or_default();
        self.writer().execute(
            "UPDATE vibe_entries SET schema_version = ?2, name = ?3, record = ?4 WHERE id = ?1",
            params![id, schema_version, name, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    /// Insert a record as-is; used for legacy imports and fixtures
    pub fn insert_raw_record(&self, id: &str, schema_version: u32, value: &Value) -> StorageResult<()> {
        let name = value.get("name").and_then(Value::as_str).unwrap_or_default();
        let created_at = value
            .get("createdAt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.timestamp_millis())
            .unwrap_or_default();
        self.writer().execute(
            "INSERT INTO vibe_entries (id, name, schema_version, created_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, name, schema_version, created_at, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    /// Control state of the migration driver.
    ///
    /// A catalog without a control row is either brand new (no entries,
    /// starts at the current version) or predates versioning (version 1).
    pub fn migration_state(&self) -> StorageResult<MigrationState> {
        let mut conn = self.writer();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                "SELECT schema_version, in_progress, target_version, backup_dir, last_error
                 FROM migration_state WHERE id = 1",
                [],
                |row| {
                    Ok(MigrationState {
                        schema_version: row.get(0)?,
                        in_progress: row.get(1)?,
                        target_version: row.get(2)?,
                        backup_dir: row.get::<_, Option<String>>(3)?.map(PathBuf::from),
                        last_error: row.get(4)?,
                    })
                },
            )
            .optional()?;

        let state = match existing {
            Some(state) => state,
            None => {
                let entries: i64 = tx.query_row("SELECT COUNT(*) FROM vibe_entries", [], |row| row.get(0))?;
                let state = MigrationState::at_version(if entries == 0 { CURRENT_SCHEMA_VERSION } else { 1 });
                write_state(&tx, &state)?;
                state
            }
        };
        tx.commit()?;
        Ok(state)
    }

    pub fn save_migration_state(&self, state: &MigrationState) -> StorageResult<()> {
        write_state(&self.writer(), state)
    }

    /// Remove every entry row; returns how many were removed
    pub fn clear(&self) -> StorageResult<usize> {
        Ok(self.writer().execute("DELETE FROM vibe_entries", [])?)
    }

    /// Fold the WAL back into the main file; called on shutdown
    pub fn checkpoint(&self) -> StorageResult<()> {
        self.writer()
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}

/// Initialize the database schema.
/// Creates all necessary tables and indexes if they don't exist.
fn init_schema(conn: &Connection) -> StorageResult<()> {
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    tracing::debug!(mode = %mode, "catalog journal mode");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS vibe_entries (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL,
            schema_version  INTEGER NOT NULL,
            created_at      INTEGER NOT NULL,
            record          TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_vibe_entries_created_at
            ON vibe_entries(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_vibe_entries_name
            ON vibe_entries(name);
        CREATE TABLE IF NOT EXISTS migration_state (
            id              INTEGER PRIMARY KEY CHECK (id = 1),
            schema_version  INTEGER NOT NULL,
            in_progress     INTEGER NOT NULL DEFAULT 0,
            target_version  INTEGER,
            backup_dir      TEXT,
            last_error      TEXT
        );
        "#,
    )?;
    Ok(())
}

fn write_state(conn: &Connection, state: &MigrationState) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO migration_state (id, schema_version, in_progress, target_version, backup_dir, last_error)
         VALUES (1, ?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            schema_version = excluded.schema_version,
            in_progress = excluded.in_progress,
            target_version = excluded.target_version,
            backup_dir = excluded.backup_dir,
            last_error = excluded.last_error",
        params![
            state.schema_version,
            state.in_progress,
            state.target_version,
            state.backup_dir.as_ref().map(|p| p.to_string_lossy().to_string()),
            state.last_error,
        ],
    )?;
    Ok(())
}

// Implement Debug for better error messages
impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("db_path", &self.db_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::edit::VibeParams;

    fn open_temp() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("catalog.db")).unwrap();
        (dir, catalog)
    }

    #[test]
    fn test_crud() {
        let (_dir, catalog) = open_temp();
        let mut entry = VibeLibraryEntry::new("Sunset", VibeParams::default());
        entry.vibe_encoding = Some("AQID".into());

        catalog.insert_entry(&entry).unwrap();
        assert_eq!(catalog.entry_count().unwrap(), 1);
        assert_eq!(catalog.get_entry(&entry.id).unwrap(), Some(entry.clone()));

        entry.name = "Dusk".into();
        assert!(catalog.update_entry(&entry).unwrap());
        assert_eq!(catalog.get_entry(&entry.id).unwrap().unwrap().name, "Dusk");

        assert!(catalog.delete_entry(&entry.id).unwrap());
        assert!(!catalog.delete_entry(&entry.id).unwrap());
        assert!(catalog.get_entry(&entry.id).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let (_dir, catalog) = open_temp();
        let entry = VibeLibraryEntry::new("a", VibeParams::default());
        catalog.insert_entry(&entry).unwrap();
        assert!(matches!(catalog.insert_entry(&entry), Err(StorageError::Catalog(_))));
        catalog.upsert_entry(&entry).unwrap();
        assert_eq!(catalog.entry_count().unwrap(), 1);
    }

    #[test]
    fn test_increment_used_count() {
        let (_dir, catalog) = open_temp();
        let entry = VibeLibraryEntry::new("a", VibeParams::default());
        catalog.insert_entry(&entry).unwrap();

        let now = Utc::now();
        let bumped = catalog.increment_used_count(&entry.id, now).unwrap().unwrap();
        assert_eq!(bumped.used_count, 2);
        assert_eq!(bumped.last_used_at, Some(now));
        assert!(catalog.increment_used_count("missing", now).unwrap().is_none());
    }

    #[test]
    fn test_all_entries_newest_first() {
        let (_dir, catalog) = open_temp();
        let mut old = VibeLibraryEntry::new("old", VibeParams::default());
        old.created_at = Utc::now() - chrono::Duration::days(1);
        let new = VibeLibraryEntry::new("new", VibeParams::default());
        catalog.insert_entry(&old).unwrap();
        catalog.insert_entry(&new).unwrap();

        let names: Vec<_> = catalog.all_entries().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["new", "old"]);
    }

    #[test]
    fn test_fresh_catalog_starts_current() {
        let (_dir, catalog) = open_temp();
        let state = catalog.migration_state().unwrap();
        assert_eq!(state.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(!state.in_progress);
    }

    #[test]
    fn test_unversioned_catalog_with_rows_is_v1() {
        let (_dir, catalog) = open_temp();
        catalog
            .insert_raw_record("legacy", 1, &serde_json::json!({"id": "legacy", "name": "old"}))
            .unwrap();
        assert_eq!(catalog.migration_state().unwrap().schema_version, 1);

        let mut state = catalog.migration_state().unwrap();
        state.in_progress = true;
        state.backup_dir = Some(PathBuf::from("/tmp/backup"));
        catalog.save_migration_state(&state).unwrap();
        assert_eq!(catalog.migration_state().unwrap(), state);
    }
}
