//! SQLite-backed record store.
//!
//! Persists captured records locally so capture works offline, and tracks
//! their per-record sync state and per-batch export state.

use chrono::DateTime;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use fieldsync_common::{BatchId, Error, FieldValues, FormId, RecordId, Result};
use fieldsync_forms::DuplicatePolicy;

use crate::record::{now_millis, ReconcileOutcome, Record};

/// Schema version written to `store_meta`.
const SCHEMA_VERSION: i64 = 2;

const RECORD_COLUMNS: &str =
    "id, form_id, record_key, data, captured_at, synced, exported, export_batch_id";

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Local record table.
///
/// All access goes through one connection guarded by a mutex, so every
/// mutation is serialized.
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Create or open a record database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    /// - Database written by a newer schema version
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path).map_err(storage_err)?;
        let store = Self::init(conn)?;
        info!("Record store opened at {}", db_path.display());
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                form_id TEXT NOT NULL,
                record_key TEXT NOT NULL,
                data TEXT NOT NULL,
                captured_at INTEGER NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                exported INTEGER NOT NULL DEFAULT 0,
                export_batch_id TEXT NOT NULL DEFAULT '',
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS export_locks (
                form_id TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                acquired_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_form_key ON records(form_id, record_key);
            CREATE INDEX IF NOT EXISTS idx_records_form_exported ON records(form_id, exported);
            CREATE INDEX IF NOT EXISTS idx_records_batch ON records(export_batch_id);
            "#,
        )
        .map_err(storage_err)?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;

        match version.and_then(|v| v.parse::<i64>().ok()) {
            Some(v) if v > SCHEMA_VERSION => {
                return Err(Error::Storage(format!(
                    "database schema version {} is newer than supported version {}",
                    v, SCHEMA_VERSION
                )));
            }
            Some(SCHEMA_VERSION) => {}
            Some(v) => {
                info!("Migrating record store from schema version {}", v);
                conn.execute_batch(
                    r#"
                    ALTER TABLE records ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;
                    ALTER TABLE records ADD COLUMN next_attempt_at INTEGER NOT NULL DEFAULT 0;
                    "#,
                )
                .map_err(storage_err)?;
                write_schema_version(&conn)?;
            }
            None => write_schema_version(&conn)?,
        }

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_pending ON records(synced, next_attempt_at)",
            [],
        )
        .map_err(storage_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("record store lock poisoned".to_string()))
    }

    /// Insert a freshly captured record, applying the form's duplicate policy.
    ///
    /// Lookup and write happen in one transaction.
    pub fn insert_or_reconcile(
        &self,
        record: &Record,
        policy: DuplicatePolicy,
    ) -> Result<ReconcileOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;

        let existing = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {} FROM records WHERE form_id = ?1 AND record_key = ?2 ORDER BY seq LIMIT 1",
                    RECORD_COLUMNS
                ))
                .map_err(storage_err)?;
            stmt.query_row(params![record.form_id.as_str(), record.key], read_row)
                .optional()
                .map_err(storage_err)?
        };

        let outcome = match (existing, policy) {
            (Some(_), DuplicatePolicy::Error) => {
                debug!(
                    form_id = %record.form_id,
                    key = %record.key,
                    "Rejecting duplicate key"
                );
                return Ok(ReconcileOutcome::Rejected {
                    reason: "duplicate key".to_string(),
                });
            }
            (Some(raw), DuplicatePolicy::Update) => {
                let mut existing = raw.into_record()?;
                tx.execute(
                    "UPDATE records SET data = ?1, captured_at = ?2 WHERE id = ?3",
                    params![
                        record.data_json(),
                        record.captured_at.timestamp_millis(),
                        existing.id.as_str()
                    ],
                )
                .map_err(storage_err)?;
                existing.data = record.data.clone();
                existing.captured_at = record.captured_at;
                debug!(record_id = %existing.id, key = %record.key, "Updated record in place");
                ReconcileOutcome::Updated(existing)
            }
            (_, _) => {
                insert_row(&tx, record)?;
                debug!(record_id = %record.id, form_id = %record.form_id, "Inserted record");
                ReconcileOutcome::Inserted(record.clone())
            }
        };

        tx.commit().map_err(storage_err)?;
        Ok(outcome)
    }

    /// Mark a record as delivered to the ingest endpoint.
    ///
    /// Idempotent. Returns `true` if this call performed the transition.
    pub fn mark_synced(&self, id: &RecordId) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE records SET synced = 1 WHERE id = ?1 AND synced = 0",
                params![id.as_str()],
            )
            .map_err(storage_err)?;
        if changed > 0 {
            return Ok(true);
        }

        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM records WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(Error::NotFound(format!("record {}", id))),
        }
    }

    /// Mark every record in `ids` as exported under `batch_id`.
    ///
    /// All-or-nothing: if any id is unknown or already exported, no record
    /// is changed.
    pub fn mark_exported(&self, ids: &[RecordId], batch_id: &BatchId) -> Result<()> {
        if ids.is_empty() {
            return Err(Error::InvalidInput(
                "cannot mark an empty batch as exported".to_string(),
            ));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "UPDATE records SET exported = 1, export_batch_id = ?2 WHERE id = ?1 AND exported = 0",
                )
                .map_err(storage_err)?;
            for id in ids {
                let changed = stmt
                    .execute(params![id.as_str(), batch_id.as_str()])
                    .map_err(|e| Error::BatchMarking(e.to_string()))?;
                if changed != 1 {
                    warn!(
                        record_id = %id,
                        batch_id = %batch_id,
                        "Record missing or already exported, rolling back batch"
                    );
                    return Err(Error::BatchMarking(format!(
                        "record {} is missing or already exported",
                        id
                    )));
                }
            }
        }
        tx.commit()
            .map_err(|e| Error::BatchMarking(e.to_string()))?;

        info!(batch_id = %batch_id, count = ids.len(), "Marked batch as exported");
        Ok(())
    }

    /// Get a record by id.
    pub fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM records WHERE id = ?1", RECORD_COLUMNS),
                params![id.as_str()],
                read_row,
            )
            .optional()
            .map_err(storage_err)?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// Records of a form not yet exported, in insertion order.
    pub fn unexported_by_form(&self, form_id: &FormId) -> Result<Vec<Record>> {
        self.query_records(
            "WHERE form_id = ?1 AND exported = 0 ORDER BY seq",
            params![form_id.as_str()],
        )
    }

    /// Every record of a form, in insertion order.
    pub fn by_form(&self, form_id: &FormId) -> Result<Vec<Record>> {
        self.query_records("WHERE form_id = ?1 ORDER BY seq", params![form_id.as_str()])
    }

    /// Records awaiting delivery to the ingest endpoint, oldest first.
    pub fn unsynced(&self, limit: usize) -> Result<Vec<Record>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query_records("WHERE synced = 0 ORDER BY seq LIMIT ?1", params![limit])
    }

    /// Unsynced records whose next delivery attempt is due, oldest first.
    pub fn due_for_delivery(&self, limit: usize) -> Result<Vec<Record>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let now = now_millis().timestamp_millis();
        self.query_records(
            "WHERE synced = 0 AND next_attempt_at <= ?1 ORDER BY seq LIMIT ?2",
            params![now, limit],
        )
    }

    /// Count a failed delivery and push the record's next attempt back.
    ///
    /// `backoff` maps the new attempt count to the wait before the next
    /// try. Returns the attempt count.
    pub fn defer_delivery(
        &self,
        id: &RecordId,
        backoff: impl FnOnce(u32) -> Duration,
    ) -> Result<u32> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;

        let changed = tx
            .execute(
                "UPDATE records SET attempts = attempts + 1 WHERE id = ?1",
                params![id.as_str()],
            )
            .map_err(storage_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("record {}", id)));
        }
        let attempts: i64 = tx
            .query_row(
                "SELECT attempts FROM records WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        let attempts = u32::try_from(attempts).unwrap_or(u32::MAX);

        let wait = i64::try_from(backoff(attempts).as_millis()).unwrap_or(i64::MAX);
        let next_attempt_at = now_millis().timestamp_millis().saturating_add(wait);
        tx.execute(
            "UPDATE records SET next_attempt_at = ?1 WHERE id = ?2",
            params![next_attempt_at, id.as_str()],
        )
        .map_err(storage_err)?;
        tx.commit().map_err(storage_err)?;

        debug!(record_id = %id, attempts, "Deferred delivery by {}ms", wait);
        Ok(attempts)
    }

    /// Claim the export lock of a form.
    ///
    /// The lock lives in the database, so it holds across every store opened
    /// on the same file. A lock older than `stale_after` is taken over.
    /// Returns the lease token, or `None` while someone else holds the lock.
    pub fn try_lock_export(
        &self,
        form_id: &FormId,
        stale_after: Duration,
    ) -> Result<Option<String>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;

        let now = now_millis().timestamp_millis();
        let cutoff =
            now.saturating_sub(i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX));
        let stale = tx
            .execute(
                "DELETE FROM export_locks WHERE form_id = ?1 AND acquired_at < ?2",
                params![form_id.as_str(), cutoff],
            )
            .map_err(storage_err)?;
        if stale > 0 {
            warn!(form_id = %form_id, "Taking over stale export lock");
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let claimed = tx
            .execute(
                "INSERT OR IGNORE INTO export_locks (form_id, token, acquired_at) VALUES (?1, ?2, ?3)",
                params![form_id.as_str(), token, now],
            )
            .map_err(storage_err)?;
        tx.commit().map_err(storage_err)?;

        Ok((claimed == 1).then_some(token))
    }

    /// Release an export lock claimed with [`try_lock_export`](Self::try_lock_export).
    ///
    /// A lock that was taken over by another holder is left alone.
    pub fn release_export_lock(&self, form_id: &FormId, token: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM export_locks WHERE form_id = ?1 AND token = ?2",
            params![form_id.as_str(), token],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Records sharing one export identifier.
    pub fn by_batch_id(&self, batch_id: &BatchId) -> Result<Vec<Record>> {
        self.query_records(
            "WHERE export_batch_id = ?1 ORDER BY seq",
            params![batch_id.as_str()],
        )
    }

    /// Distinct non-empty export identifiers. Order is not significant.
    pub fn distinct_batch_ids(&self) -> Result<Vec<BatchId>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT export_batch_id FROM records WHERE export_batch_id != '' \
                 GROUP BY export_batch_id ORDER BY MIN(seq)",
            )
            .map_err(storage_err)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;

        let mut result = Vec::new();
        for id in ids {
            result.push(BatchId::new(id.map_err(storage_err)?)?);
        }
        Ok(result)
    }

    /// Number of records of a form carrying `key`.
    pub fn count_by_key(&self, form_id: &FormId, key: &str) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM records WHERE form_id = ?1 AND record_key = ?2",
                params![form_id.as_str(), key],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as u64)
    }

    /// Get total record count.
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(count as u64)
    }

    fn query_records(&self, clause: &str, params: impl rusqlite::Params) -> Result<Vec<Record>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM records {}", RECORD_COLUMNS, clause))
            .map_err(storage_err)?;
        let rows = stmt.query_map(params, read_row).map_err(storage_err)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(storage_err)?.into_record()?);
        }
        Ok(result)
    }
}

fn write_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO store_meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn insert_row(conn: &Connection, record: &Record) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO records
        (id, form_id, record_key, data, captured_at, synced, exported, export_batch_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            record.id.as_str(),
            record.form_id.as_str(),
            record.key,
            record.data_json(),
            record.captured_at.timestamp_millis(),
            record.synced as i32,
            record.exported as i32,
            record
                .export_batch_id
                .as_ref()
                .map(BatchId::as_str)
                .unwrap_or(""),
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

/// Row as read from the table, before identifier checks.
struct RawRecord {
    id: String,
    form_id: String,
    key: String,
    data: String,
    captured_at: i64,
    synced: bool,
    exported: bool,
    export_batch_id: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        form_id: row.get(1)?,
        key: row.get(2)?,
        data: row.get(3)?,
        captured_at: row.get(4)?,
        synced: row.get::<_, i64>(5)? != 0,
        exported: row.get::<_, i64>(6)? != 0,
        export_batch_id: row.get(7)?,
    })
}

impl RawRecord {
    fn into_record(self) -> Result<Record> {
        // A corrupt payload degrades to an empty record rather than failing the query.
        let data = match serde_json::from_str::<FieldValues>(&self.data) {
            Ok(data) => data,
            Err(e) => {
                warn!(record_id = %self.id, "Malformed record payload: {}", e);
                FieldValues::new()
            }
        };
        let captured_at = DateTime::from_timestamp_millis(self.captured_at).unwrap_or_else(|| {
            warn!(record_id = %self.id, "Invalid capture timestamp {}", self.captured_at);
            now_millis()
        });
        let export_batch_id = if self.export_batch_id.is_empty() {
            None
        } else {
            Some(BatchId::new(self.export_batch_id)?)
        };

        Ok(Record {
            id: RecordId::new(self.id)?,
            form_id: FormId::new(self.form_id)?,
            key: self.key,
            data,
            captured_at,
            synced: self.synced,
            exported: self.exported,
            export_batch_id,
        })
    }
}
