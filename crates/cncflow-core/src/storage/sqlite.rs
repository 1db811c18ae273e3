//! Embedded SQLite store.
//!
//! Instants are stored as epoch milliseconds, JSON payloads as TEXT. A
//! serializable transaction takes the write lock up front (`IMMEDIATE`);
//! read-committed transactions start `DEFERRED`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, trace};

use super::{Isolation, Store, StoreTx};
use crate::error::{Error, Result, StorageError};
use crate::model::{
    AcquisitionMarker, AlarmInterval, AlarmKey, Detection, DetectionKind, ImportLogEntry, ImportLogLevel,
    IntervalKind, StateInterval, VariableRecord,
};
use crate::record::{Command, ModuleId};

/// Schema of the reference database.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS intervals (
    kind TEXT NOT NULL,
    module_id INTEGER NOT NULL,
    begin_ms INTEGER NOT NULL,
    end_ms INTEGER NOT NULL,
    state INTEGER NOT NULL,
    PRIMARY KEY (kind, module_id, begin_ms)
);

CREATE TABLE IF NOT EXISTS alarms (
    module_id INTEGER NOT NULL,
    cnc_info TEXT NOT NULL,
    cnc_sub_info TEXT NOT NULL,
    alarm_type TEXT NOT NULL,
    number TEXT NOT NULL,
    begin_ms INTEGER NOT NULL,
    end_ms INTEGER NOT NULL,
    message TEXT NOT NULL,
    properties TEXT NOT NULL,
    open INTEGER NOT NULL,
    PRIMARY KEY (module_id, cnc_info, cnc_sub_info, alarm_type, number, begin_ms)
);
CREATE INDEX IF NOT EXISTS idx_alarms_open ON alarms(module_id, open);

CREATE TABLE IF NOT EXISTS variables (
    module_id INTEGER NOT NULL,
    key TEXT NOT NULL,
    begin_ms INTEGER NOT NULL,
    end_ms INTEGER,
    payload TEXT NOT NULL,
    PRIMARY KEY (module_id, key, begin_ms)
);

CREATE TABLE IF NOT EXISTS stamps (
    stamp_id INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS detections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    module_id INTEGER NOT NULL,
    at_ms INTEGER NOT NULL,
    kind TEXT NOT NULL,
    stamp_id INTEGER REFERENCES stamps(stamp_id),
    sequence INTEGER,
    milestone_secs REAL
);
CREATE INDEX IF NOT EXISTS idx_detections_at ON detections(at_ms);

CREATE TABLE IF NOT EXISTS acquisition_markers (
    module_id INTEGER NOT NULL,
    command TEXT NOT NULL,
    at_ms INTEGER NOT NULL,
    content TEXT NOT NULL,
    PRIMARY KEY (module_id, command)
);

CREATE TABLE IF NOT EXISTS import_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    module_id INTEGER NOT NULL,
    at_ms INTEGER NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL
);
";

/// [`Store`] backed by one SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(map_sqlite)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;")
            .map_err(map_sqlite)?;
        debug!(path = %path.display(), "Opened SQLite store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_sqlite)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(map_sqlite)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL).map_err(map_sqlite)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pre-register a stamp outside of any import transaction.
    pub fn add_stamp(&self, stamp_id: i64) -> Result<()> {
        self.lock()
            .execute(
                "INSERT OR IGNORE INTO stamps (stamp_id) VALUES (?1)",
                params![stamp_id],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    /// Reclaim free pages.
    pub fn vacuum(&self) -> Result<()> {
        self.lock().execute_batch("VACUUM").map_err(map_sqlite)
    }
}

impl Store for SqliteStore {
    fn transaction<T, F>(&self, name: &str, isolation: Isolation, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>,
    {
        let mut conn = self.lock();
        let behavior = match isolation {
            Isolation::ReadCommitted => TransactionBehavior::Deferred,
            Isolation::Serializable => TransactionBehavior::Immediate,
        };
        let tx = conn
            .transaction_with_behavior(behavior)
            .map_err(map_sqlite)?;
        trace!(transaction = name, ?isolation, "Begin SQLite transaction");
        let value = {
            let mut handle = SqliteTx { conn: &tx };
            f(&mut handle)?
        };
        tx.commit().map_err(map_sqlite)?;
        Ok(value)
    }
}

/// Map a rusqlite failure onto the storage fault vocabulary.
pub(crate) fn map_sqlite(error: rusqlite::Error) -> Error {
    let storage = match &error {
        rusqlite::Error::SqliteFailure(failure, _) => {
            let text = error.to_string();
            match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StorageError::Busy(text),
                ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::FileLockingProtocolFailed => StorageError::Unavailable(text),
                ErrorCode::SchemaChanged => StorageError::StaleRead(text),
                ErrorCode::OutOfMemory => StorageError::OutOfMemory(text),
                ErrorCode::PermissionDenied | ErrorCode::AuthorizationForStatementDenied => {
                    StorageError::Unauthorized(text)
                }
                ErrorCode::ReadOnly | ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    StorageError::Invalid(text)
                }
                _ => StorageError::Database(text),
            }
        }
        rusqlite::Error::QueryReturnedNoRows => StorageError::NotFound(error.to_string()),
        _ => StorageError::Database(error.to_string()),
    };
    Error::Storage(storage)
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Invalid(format!("timestamp out of range: {ms}ms")).into())
}

fn module_param(module: ModuleId) -> i64 {
    module.0 as i64
}

struct SqliteTx<'a> {
    conn: &'a Connection,
}

/// Raw variable row before JSON and timestamp decoding.
type VariableRow = (String, i64, Option<i64>, String);

fn decode_variable((key, begin_ms, end_ms, payload): VariableRow) -> Result<VariableRecord> {
    Ok(VariableRecord {
        key,
        payload: serde_json::from_str(&payload)?,
        begin: from_ms(begin_ms)?,
        end: end_ms.map(from_ms).transpose()?,
    })
}

/// Raw alarm row before JSON and timestamp decoding.
struct AlarmRow {
    key: AlarmKey,
    begin_ms: i64,
    end_ms: i64,
    message: String,
    properties: String,
    open: bool,
}

const ALARM_COLUMNS: &str =
    "cnc_info, cnc_sub_info, alarm_type, number, begin_ms, end_ms, message, properties, open";

fn read_alarm_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlarmRow> {
    Ok(AlarmRow {
        key: AlarmKey {
            cnc_info: row.get(0)?,
            cnc_sub_info: row.get(1)?,
            alarm_type: row.get(2)?,
            number: row.get(3)?,
        },
        begin_ms: row.get(4)?,
        end_ms: row.get(5)?,
        message: row.get(6)?,
        properties: row.get(7)?,
        open: row.get(8)?,
    })
}

fn decode_alarm(row: AlarmRow) -> Result<AlarmInterval> {
    Ok(AlarmInterval {
        key: row.key,
        message: row.message,
        properties: serde_json::from_str(&row.properties)?,
        begin: from_ms(row.begin_ms)?,
        end: from_ms(row.end_ms)?,
        open: row.open,
    })
}

impl SqliteTx<'_> {
    fn query_alarms(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<AlarmInterval>> {
        let mut stmt = self.conn.prepare(sql).map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params, read_alarm_row)
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        rows.into_iter().map(decode_alarm).collect()
    }

    fn query_variables(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<VariableRecord>> {
        let mut stmt = self.conn.prepare(sql).map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<VariableRow>>>()
            .map_err(map_sqlite)?;
        rows.into_iter().map(decode_variable).collect()
    }

    fn query_intervals(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<StateInterval>> {
        let mut stmt = self.conn.prepare(sql).map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get(2)?))
            })
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<(i64, i64, i64)>>>()
            .map_err(map_sqlite)?;
        rows.into_iter()
            .map(|(begin, end, state)| -> Result<StateInterval> {
                Ok(StateInterval::new(from_ms(begin)?, from_ms(end)?, state))
            })
            .collect()
    }
}

impl StoreTx for SqliteTx<'_> {
    fn last_interval(
        &mut self,
        kind: IntervalKind,
        module: ModuleId,
    ) -> Result<Option<StateInterval>> {
        Ok(self
            .query_intervals(
                "SELECT begin_ms, end_ms, state FROM intervals
                 WHERE kind = ?1 AND module_id = ?2 ORDER BY begin_ms DESC LIMIT 1",
                params![kind.as_str(), module_param(module)],
            )?
            .pop())
    }

    fn upsert_interval(
        &mut self,
        kind: IntervalKind,
        module: ModuleId,
        interval: &StateInterval,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO intervals (kind, module_id, begin_ms, end_ms, state)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(kind, module_id, begin_ms)
                 DO UPDATE SET end_ms = excluded.end_ms, state = excluded.state",
                params![
                    kind.as_str(),
                    module_param(module),
                    to_ms(interval.begin),
                    to_ms(interval.end),
                    interval.state
                ],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    fn intervals(&mut self, kind: IntervalKind, module: ModuleId) -> Result<Vec<StateInterval>> {
        self.query_intervals(
            "SELECT begin_ms, end_ms, state FROM intervals
             WHERE kind = ?1 AND module_id = ?2 ORDER BY begin_ms",
            params![kind.as_str(), module_param(module)],
        )
    }

    fn open_alarms(&mut self, module: ModuleId) -> Result<Vec<AlarmInterval>> {
        self.query_alarms(
            &format!(
                "SELECT {ALARM_COLUMNS} FROM alarms WHERE module_id = ?1 AND open = 1
                 ORDER BY cnc_info, cnc_sub_info, alarm_type, number, begin_ms"
            ),
            params![module_param(module)],
        )
    }

    fn last_alarm(&mut self, module: ModuleId, key: &AlarmKey) -> Result<Option<AlarmInterval>> {
        Ok(self
            .query_alarms(
                &format!(
                    "SELECT {ALARM_COLUMNS} FROM alarms
                     WHERE module_id = ?1 AND cnc_info = ?2 AND cnc_sub_info = ?3
                       AND alarm_type = ?4 AND number = ?5
                     ORDER BY begin_ms DESC LIMIT 1"
                ),
                params![
                    module_param(module),
                    key.cnc_info,
                    key.cnc_sub_info,
                    key.alarm_type,
                    key.number
                ],
            )?
            .pop())
    }

    fn upsert_alarm(&mut self, module: ModuleId, alarm: &AlarmInterval) -> Result<()> {
        let properties = serde_json::to_string(&alarm.properties)?;
        self.conn
            .execute(
                "INSERT INTO alarms (module_id, cnc_info, cnc_sub_info, alarm_type, number,
                                     begin_ms, end_ms, message, properties, open)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(module_id, cnc_info, cnc_sub_info, alarm_type, number, begin_ms)
                 DO UPDATE SET end_ms = excluded.end_ms, message = excluded.message,
                               properties = excluded.properties, open = excluded.open",
                params![
                    module_param(module),
                    alarm.key.cnc_info,
                    alarm.key.cnc_sub_info,
                    alarm.key.alarm_type,
                    alarm.key.number,
                    to_ms(alarm.begin),
                    to_ms(alarm.end),
                    alarm.message,
                    properties,
                    alarm.open
                ],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    fn alarms(&mut self, module: ModuleId) -> Result<Vec<AlarmInterval>> {
        self.query_alarms(
            &format!(
                "SELECT {ALARM_COLUMNS} FROM alarms WHERE module_id = ?1
                 ORDER BY cnc_info, cnc_sub_info, alarm_type, number, begin_ms"
            ),
            params![module_param(module)],
        )
    }

    fn current_variable(
        &mut self,
        module: ModuleId,
        key: &str,
    ) -> Result<Option<VariableRecord>> {
        Ok(self
            .query_variables(
                "SELECT key, begin_ms, end_ms, payload FROM variables
                 WHERE module_id = ?1 AND key = ?2 ORDER BY begin_ms DESC LIMIT 1",
                params![module_param(module), key],
            )?
            .pop())
    }

    fn variables(&mut self, module: ModuleId, key: &str) -> Result<Vec<VariableRecord>> {
        self.query_variables(
            "SELECT key, begin_ms, end_ms, payload FROM variables
             WHERE module_id = ?1 AND key = ?2 ORDER BY begin_ms",
            params![module_param(module), key],
        )
    }

    fn variable_keys(&mut self, module: ModuleId) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT key FROM variables WHERE module_id = ?1 ORDER BY key")
            .map_err(map_sqlite)?;
        stmt.query_map(params![module_param(module)], |row| row.get(0))
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(map_sqlite)
    }

    fn insert_variable(&mut self, module: ModuleId, record: &VariableRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        self.conn
            .execute(
                "INSERT INTO variables (module_id, key, begin_ms, end_ms, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    module_param(module),
                    record.key,
                    to_ms(record.begin),
                    record.end.map(to_ms),
                    payload
                ],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    fn set_variable_end(
        &mut self,
        module: ModuleId,
        key: &str,
        begin: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE variables SET end_ms = ?4 WHERE module_id = ?1 AND key = ?2 AND begin_ms = ?3",
                params![module_param(module), key, to_ms(begin), end.map(to_ms)],
            )
            .map_err(map_sqlite)?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("variable {key}@{begin}")).into());
        }
        Ok(())
    }

    fn delete_variable(
        &mut self,
        module: ModuleId,
        key: &str,
        begin: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM variables WHERE module_id = ?1 AND key = ?2 AND begin_ms = ?3",
                params![module_param(module), key, to_ms(begin)],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    fn stamp_exists(&mut self, stamp_id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT stamp_id FROM stamps WHERE stamp_id = ?1",
                params![stamp_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqlite)?;
        Ok(found.is_some())
    }

    fn create_stamp(&mut self, stamp_id: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO stamps (stamp_id) VALUES (?1)",
                params![stamp_id],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    fn insert_detection(&mut self, detection: &Detection) -> Result<()> {
        let (kind, stamp_id, sequence, milestone_secs) = match detection.kind {
            DetectionKind::Stamp { stamp_id } => ("stamp", Some(stamp_id), None, None),
            DetectionKind::Milestone {
                sequence,
                milestone_secs,
            } => ("milestone", None, Some(sequence), Some(milestone_secs)),
        };
        self.conn
            .execute(
                "INSERT INTO detections (module_id, at_ms, kind, stamp_id, sequence, milestone_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    module_param(detection.module),
                    to_ms(detection.at),
                    kind,
                    stamp_id,
                    sequence,
                    milestone_secs
                ],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    fn detections(&mut self, module: ModuleId) -> Result<Vec<Detection>> {
        type Row = (i64, String, Option<i64>, Option<i64>, Option<f64>);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT at_ms, kind, stamp_id, sequence, milestone_secs FROM detections
                 WHERE module_id = ?1 ORDER BY at_ms, id",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params![module_param(module)], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<Row>>>()
            .map_err(map_sqlite)?;

        rows.into_iter()
            .map(|(at_ms, kind, stamp_id, sequence, milestone_secs)| -> Result<Detection> {
                let kind = match (kind.as_str(), stamp_id, sequence, milestone_secs) {
                    ("stamp", Some(stamp_id), _, _) => DetectionKind::Stamp { stamp_id },
                    ("milestone", _, Some(sequence), Some(milestone_secs)) => {
                        DetectionKind::Milestone {
                            sequence,
                            milestone_secs,
                        }
                    }
                    (other, ..) => {
                        return Err(StorageError::Invalid(format!(
                            "malformed detection row of kind {other}"
                        ))
                        .into());
                    }
                };
                Ok(Detection {
                    module,
                    at: from_ms(at_ms)?,
                    kind,
                })
            })
            .collect()
    }

    fn delete_detections_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM detections WHERE at_ms < ?1",
                params![to_ms(cutoff)],
            )
            .map_err(map_sqlite)
    }

    fn acquisition_marker(
        &mut self,
        module: ModuleId,
        command: Command,
    ) -> Result<Option<AcquisitionMarker>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT at_ms, content FROM acquisition_markers WHERE module_id = ?1 AND command = ?2",
                params![module_param(module), command.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(map_sqlite)?;
        row.map(|(at_ms, content)| -> Result<AcquisitionMarker> {
            Ok(AcquisitionMarker {
                at: from_ms(at_ms)?,
                content,
            })
        })
        .transpose()
    }

    fn set_acquisition_marker(
        &mut self,
        module: ModuleId,
        command: Command,
        marker: &AcquisitionMarker,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO acquisition_markers (module_id, command, at_ms, content)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(module_id, command)
                 DO UPDATE SET at_ms = excluded.at_ms, content = excluded.content",
                params![
                    module_param(module),
                    command.as_str(),
                    to_ms(marker.at),
                    marker.content
                ],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    fn log_import(&mut self, entry: &ImportLogEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO import_log (module_id, at_ms, level, message) VALUES (?1, ?2, ?3, ?4)",
                params![
                    module_param(entry.module),
                    to_ms(entry.at),
                    entry.level.as_str(),
                    entry.message
                ],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    fn import_log(&mut self, module: ModuleId) -> Result<Vec<ImportLogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT at_ms, level, message FROM import_log WHERE module_id = ?1 ORDER BY id",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params![module_param(module)], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        rows.into_iter()
            .map(|(at_ms, level, message)| -> Result<ImportLogEntry> {
                let level = match level.as_str() {
                    "warning" => ImportLogLevel::Warning,
                    "error" => ImportLogLevel::Error,
                    other => {
                        return Err(
                            StorageError::Invalid(format!("unknown log level {other}")).into()
                        );
                    }
                };
                Ok(ImportLogEntry {
                    module,
                    at: from_ms(at_ms)?,
                    level,
                    message,
                })
            })
            .collect()
    }
}
