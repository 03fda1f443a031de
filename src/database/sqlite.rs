use super::{
    RecordStore, RecordTransaction, UploadEventListParameters, UploadRecordListParameters,
};
use crate::error::{CourierError, Result};
use crate::logging::{log_info, log_warn};
use crate::model::{
    AccessStyle, BucketConfiguration, BucketName, BucketReferenceName, Settings,
    UploadConfiguration, UploadEventNew, UploadEventRecord, UploadId, UploadName, UploadPolicy,
    UploadRecord, UploadResult,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use url::Url;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS buckets (
        reference_name TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        region TEXT NOT NULL,
        access_key TEXT NOT NULL,
        secret TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        access_style TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS upload_configurations (
        name TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        bucket TEXT NOT NULL,
        policy TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS upload_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        time_start INTEGER NOT NULL,
        time_end INTEGER,
        upload_name TEXT NOT NULL,
        bucket TEXT,
        reason TEXT NOT NULL,
        files_required INTEGER NOT NULL DEFAULT 0,
        files_skipped INTEGER NOT NULL DEFAULT 0,
        files_uploaded INTEGER NOT NULL DEFAULT 0,
        files_failed INTEGER NOT NULL DEFAULT 0,
        result TEXT
    );

    CREATE INDEX IF NOT EXISTS upload_records_name_idx
        ON upload_records (upload_name, id);
    CREATE INDEX IF NOT EXISTS upload_records_time_idx
        ON upload_records (time_start);

    CREATE TABLE IF NOT EXISTS upload_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        upload_id INTEGER NOT NULL REFERENCES upload_records (id) ON DELETE CASCADE,
        time INTEGER NOT NULL,
        message TEXT NOT NULL,
        file TEXT,
        exception_trace TEXT,
        failed INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS upload_events_upload_idx
        ON upload_events (upload_id, time);

    CREATE TABLE IF NOT EXISTS settings (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        data TEXT NOT NULL
    );
";

const RECORD_COLUMNS: &str = "id, time_start, time_end, upload_name, bucket, reason,
    files_required, files_skipped, files_uploaded, files_failed, result";

const EVENT_COLUMNS: &str = "id, upload_id, time, message, file, exception_trace, failed";

/// SQLite-backed record store.
///
/// One connection guarded by a mutex; a transaction holds the lock until it is
/// committed or dropped, so writers are serialized.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::config::ensure_dir(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self::from_connection(conn)?;

        log_info(
            "record-store",
            &format!("✓ Database connection established at {:?}", path),
        )
        .unwrap_or_default();

        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl RecordStore for SqliteRecordStore {
    fn transaction(&self) -> Result<Box<dyn RecordTransaction + '_>> {
        let conn = self.conn.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }
}

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                log_warn("record-store", &format!("⚠ Rollback failed: {}", e))
                    .unwrap_or_default();
            }
        }
    }
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, millis))
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<UploadRecord> {
    let time_end: Option<i64> = row.get(2)?;
    let bucket: Option<String> = row.get(4)?;
    let result: Option<String> = row.get(10)?;

    Ok(UploadRecord {
        id: row.get(0)?,
        time_start: from_millis(row.get(1)?)?,
        time_end: time_end.map(from_millis).transpose()?,
        upload_name: UploadName::new(row.get::<_, String>(3)?).map_err(|e| conversion_error(3, e))?,
        bucket: bucket
            .map(BucketReferenceName::new)
            .transpose()
            .map_err(|e| conversion_error(4, e))?,
        reason: row.get(5)?,
        files_required: row.get::<_, i64>(6)? as u64,
        files_skipped: row.get::<_, i64>(7)? as u64,
        files_uploaded: row.get::<_, i64>(8)? as u64,
        files_failed: row.get::<_, i64>(9)? as u64,
        result: match result {
            None => None,
            Some(text) => Some(UploadResult::parse(&text).ok_or_else(|| {
                conversion_error(10, CourierError::Validation(format!("Unknown result {}", text)))
            })?),
        },
    })
}

fn map_event(row: &Row<'_>) -> rusqlite::Result<UploadEventRecord> {
    Ok(UploadEventRecord {
        id: row.get(0)?,
        upload_id: row.get(1)?,
        time: from_millis(row.get(2)?)?,
        message: row.get(3)?,
        file: row.get(4)?,
        exception_trace: row.get(5)?,
        failed: row.get(6)?,
    })
}

fn map_bucket(row: &Row<'_>) -> rusqlite::Result<BucketConfiguration> {
    let access_style: String = row.get(6)?;
    let endpoint: String = row.get(5)?;

    Ok(BucketConfiguration {
        reference_name: BucketReferenceName::new(row.get::<_, String>(0)?)
            .map_err(|e| conversion_error(0, e))?,
        name: BucketName::new(row.get::<_, String>(1)?).map_err(|e| conversion_error(1, e))?,
        region: row.get(2)?,
        access_key: row.get(3)?,
        secret: row.get(4)?,
        endpoint: Url::parse(&endpoint).map_err(|e| conversion_error(5, e))?,
        access_style: serde_json::from_value(serde_json::Value::String(access_style))
            .map_err(|e| conversion_error(6, e))?,
    })
}

fn map_upload(row: &Row<'_>) -> rusqlite::Result<UploadConfiguration> {
    let source: String = row.get(1)?;
    let policy: String = row.get(3)?;

    Ok(UploadConfiguration {
        name: UploadName::new(row.get::<_, String>(0)?).map_err(|e| conversion_error(0, e))?,
        source: Url::parse(&source).map_err(|e| conversion_error(1, e))?,
        bucket: BucketReferenceName::new(row.get::<_, String>(2)?)
            .map_err(|e| conversion_error(2, e))?,
        policy: serde_json::from_str::<UploadPolicy>(&policy).map_err(|e| conversion_error(3, e))?,
    })
}

fn access_style_text(style: AccessStyle) -> Result<String> {
    match serde_json::to_value(style)? {
        serde_json::Value::String(text) => Ok(text),
        other => Err(CourierError::Invariant(format!(
            "Access style serialized as {}",
            other
        ))),
    }
}

impl RecordTransaction for SqliteTransaction<'_> {
    fn upload_record_create(
        &mut self,
        time_start: DateTime<Utc>,
        upload_name: &UploadName,
        reason: &str,
    ) -> Result<UploadRecord> {
        self.conn.execute(
            "INSERT INTO upload_records (time_start, upload_name, reason) VALUES (?1, ?2, ?3)",
            params![to_millis(time_start), upload_name.as_str(), reason],
        )?;
        let id = self.conn.last_insert_rowid();

        Ok(UploadRecord {
            id,
            time_start,
            time_end: None,
            upload_name: upload_name.clone(),
            bucket: None,
            reason: reason.to_string(),
            files_required: 0,
            files_skipped: 0,
            files_uploaded: 0,
            files_failed: 0,
            result: None,
        })
    }

    fn upload_record_update(&mut self, record: &UploadRecord) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE upload_records SET
                time_start = ?2,
                time_end = ?3,
                upload_name = ?4,
                bucket = ?5,
                reason = ?6,
                files_required = ?7,
                files_skipped = ?8,
                files_uploaded = ?9,
                files_failed = ?10,
                result = ?11
             WHERE id = ?1 AND result IS NULL",
            params![
                record.id,
                to_millis(record.time_start),
                record.time_end.map(to_millis),
                record.upload_name.as_str(),
                record.bucket.as_ref().map(|b| b.as_str()),
                record.reason,
                count(record.files_required),
                count(record.files_skipped),
                count(record.files_uploaded),
                count(record.files_failed),
                record.result.map(|r| r.as_str()),
            ],
        )?;

        if changed == 0 {
            return match self.upload_record_get(record.id)? {
                Some(_) => Err(CourierError::Validation(format!(
                    "Upload record {} is already finished",
                    record.id
                ))),
                None => Err(CourierError::Validation(format!(
                    "No such upload record: {}",
                    record.id
                ))),
            };
        }
        Ok(())
    }

    fn upload_record_get(&mut self, id: UploadId) -> Result<Option<UploadRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {} FROM upload_records WHERE id = ?1", RECORD_COLUMNS),
                params![id],
                map_record,
            )
            .optional()?;
        Ok(record)
    }

    fn upload_record_most_recent(&mut self, name: &UploadName) -> Result<Option<UploadRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM upload_records WHERE upload_name = ?1
                     ORDER BY time_start DESC, id DESC LIMIT 1",
                    RECORD_COLUMNS
                ),
                params![name.as_str()],
                map_record,
            )
            .optional()?;
        Ok(record)
    }

    fn upload_record_list(
        &mut self,
        parameters: &UploadRecordListParameters,
    ) -> Result<Vec<UploadRecord>> {
        let records = match &parameters.name {
            Some(name) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM upload_records
                     WHERE time_start >= ?1 AND upload_name = ?2
                     ORDER BY time_start, id ASC LIMIT ?3",
                    RECORD_COLUMNS
                ))?;
                let rows = stmt.query_map(
                    params![to_millis(parameters.newer_than), name.as_str(), parameters.limit],
                    map_record,
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM upload_records
                     WHERE time_start >= ?1
                     ORDER BY time_start, id ASC LIMIT ?2",
                    RECORD_COLUMNS
                ))?;
                let rows = stmt.query_map(
                    params![to_millis(parameters.newer_than), parameters.limit],
                    map_record,
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(records)
    }

    fn upload_record_delete_older_than(&mut self, time: DateTime<Utc>) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM upload_records WHERE time_start < ?1",
            params![to_millis(time)],
        )?;
        Ok(deleted)
    }

    fn upload_record_mark_unfinished_cancelled(&mut self, time: DateTime<Utc>) -> Result<usize> {
        let marked = self.conn.execute(
            "UPDATE upload_records SET result = ?1, time_end = ?2 WHERE result IS NULL",
            params![UploadResult::Cancelled.as_str(), to_millis(time)],
        )?;
        Ok(marked)
    }

    fn upload_event_add(&mut self, event: &UploadEventNew) -> Result<UploadEventRecord> {
        self.conn.execute(
            "INSERT INTO upload_events (upload_id, time, message, file, exception_trace, failed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.upload_id,
                to_millis(event.time),
                event.message,
                event.file,
                event.exception_trace,
                event.failed,
            ],
        )?;

        Ok(UploadEventRecord {
            id: self.conn.last_insert_rowid(),
            upload_id: event.upload_id,
            time: event.time,
            message: event.message.clone(),
            file: event.file.clone(),
            exception_trace: event.exception_trace.clone(),
            failed: event.failed,
        })
    }

    fn upload_event_list(
        &mut self,
        parameters: &UploadEventListParameters,
    ) -> Result<Vec<UploadEventRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM upload_events
             WHERE upload_id = ?1 AND time >= ?2
             ORDER BY time, id ASC LIMIT ?3",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                parameters.upload_id,
                to_millis(parameters.newer_than),
                parameters.limit
            ],
            map_event,
        )?;
        let events = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn bucket_list(&mut self) -> Result<Vec<BucketConfiguration>> {
        let mut stmt = self.conn.prepare(
            "SELECT reference_name, name, region, access_key, secret, endpoint, access_style
             FROM buckets ORDER BY reference_name",
        )?;
        let rows = stmt.query_map([], map_bucket)?;
        let buckets = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(buckets)
    }

    fn bucket_get(&mut self, name: &BucketReferenceName) -> Result<Option<BucketConfiguration>> {
        let bucket = self
            .conn
            .query_row(
                "SELECT reference_name, name, region, access_key, secret, endpoint, access_style
                 FROM buckets WHERE reference_name = ?1",
                params![name.as_str()],
                map_bucket,
            )
            .optional()?;
        Ok(bucket)
    }

    fn bucket_put(&mut self, bucket: &BucketConfiguration) -> Result<()> {
        self.conn.execute(
            "INSERT INTO buckets (reference_name, name, region, access_key, secret, endpoint, access_style)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (reference_name) DO UPDATE SET
                name = excluded.name,
                region = excluded.region,
                access_key = excluded.access_key,
                secret = excluded.secret,
                endpoint = excluded.endpoint,
                access_style = excluded.access_style",
            params![
                bucket.reference_name.as_str(),
                bucket.name.as_str(),
                bucket.region,
                bucket.access_key,
                bucket.secret,
                bucket.endpoint.as_str(),
                access_style_text(bucket.access_style)?,
            ],
        )?;
        Ok(())
    }

    fn bucket_delete(&mut self, name: &BucketReferenceName) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM buckets WHERE reference_name = ?1",
            params![name.as_str()],
        )?;
        Ok(deleted > 0)
    }

    fn upload_configuration_list(&mut self) -> Result<Vec<UploadConfiguration>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, source, bucket, policy FROM upload_configurations ORDER BY name",
        )?;
        let rows = stmt.query_map([], map_upload)?;
        let uploads = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(uploads)
    }

    fn upload_configuration_get(
        &mut self,
        name: &UploadName,
    ) -> Result<Option<UploadConfiguration>> {
        let upload = self
            .conn
            .query_row(
                "SELECT name, source, bucket, policy FROM upload_configurations WHERE name = ?1",
                params![name.as_str()],
                map_upload,
            )
            .optional()?;
        Ok(upload)
    }

    fn upload_configuration_put(&mut self, upload: &UploadConfiguration) -> Result<()> {
        self.conn.execute(
            "INSERT INTO upload_configurations (name, source, bucket, policy)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (name) DO UPDATE SET
                source = excluded.source,
                bucket = excluded.bucket,
                policy = excluded.policy",
            params![
                upload.name.as_str(),
                upload.source.as_str(),
                upload.bucket.as_str(),
                serde_json::to_string(&upload.policy)?,
            ],
        )?;
        Ok(())
    }

    fn upload_configuration_delete(&mut self, name: &UploadName) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM upload_configurations WHERE name = ?1",
            params![name.as_str()],
        )?;
        Ok(deleted > 0)
    }

    fn settings_get(&mut self) -> Result<Settings> {
        let data: Option<String> = self
            .conn
            .query_row("SELECT data FROM settings WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match data {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Ok(Settings::default()),
        }
    }

    fn settings_put(&mut self, settings: &Settings) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (id, data) VALUES (1, ?1)
             ON CONFLICT (id) DO UPDATE SET data = excluded.data",
            params![serde_json::to_string(settings)?],
        )?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}
