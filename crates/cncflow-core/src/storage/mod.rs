//! Transactional storage contract for consolidated entities.
//!
//! Strategies never talk to a backend directly: every mutation for one batch
//! runs inside one [`Store::transaction`] closure receiving a
//! [`StoreTx`]. Returning an error from the closure rolls the whole batch
//! back; the caller then reloads whatever it cached.
//!
//! Two backends ship with the crate:
//! - [`MemoryStore`]: copy-on-write transactions with fault injection, used by
//!   tests and dry runs
//! - [`SqliteStore`]: an embedded SQLite database (rusqlite)

mod memory;
mod sqlite;

pub use memory::{MemorySnapshot, MemoryStore};
pub use sqlite::{SCHEMA_SQL, SqliteStore};

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    AcquisitionMarker, AlarmInterval, AlarmKey, Detection, ImportLogEntry, IntervalKind, StateInterval,
    VariableRecord,
};
use crate::record::{Command, ModuleId};

/// Requested transaction isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Sufficient for a single writer per module.
    #[default]
    ReadCommitted,
    Serializable,
}

/// Operations available inside one transaction.
pub trait StoreTx {
    // --- Fact / activity intervals, keyed by (kind, module, begin) ---

    /// Interval with the greatest `begin`.
    fn last_interval(
        &mut self,
        kind: IntervalKind,
        module: ModuleId,
    ) -> Result<Option<StateInterval>>;

    /// Insert or replace the interval starting at `interval.begin`.
    fn upsert_interval(
        &mut self,
        kind: IntervalKind,
        module: ModuleId,
        interval: &StateInterval,
    ) -> Result<()>;

    /// All intervals ordered by `begin`.
    fn intervals(&mut self, kind: IntervalKind, module: ModuleId) -> Result<Vec<StateInterval>>;

    // --- Alarms, keyed by (module, key, begin) ---

    fn open_alarms(&mut self, module: ModuleId) -> Result<Vec<AlarmInterval>>;

    /// Most recent alarm occurrence for `key`, open or not.
    fn last_alarm(&mut self, module: ModuleId, key: &AlarmKey) -> Result<Option<AlarmInterval>>;

    fn upsert_alarm(&mut self, module: ModuleId, alarm: &AlarmInterval) -> Result<()>;

    /// All alarm occurrences ordered by `(key, begin)`.
    fn alarms(&mut self, module: ModuleId) -> Result<Vec<AlarmInterval>>;

    // --- Variables, keyed by (module, key, begin) ---

    /// Record with the greatest `begin` for `key`.
    fn current_variable(&mut self, module: ModuleId, key: &str)
    -> Result<Option<VariableRecord>>;

    /// Every record for `key` ordered by `begin`.
    fn variables(&mut self, module: ModuleId, key: &str) -> Result<Vec<VariableRecord>>;

    /// Distinct variable keys that have at least one record.
    fn variable_keys(&mut self, module: ModuleId) -> Result<Vec<String>>;

    fn insert_variable(&mut self, module: ModuleId, record: &VariableRecord) -> Result<()>;

    fn set_variable_end(
        &mut self,
        module: ModuleId,
        key: &str,
        begin: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()>;

    fn delete_variable(&mut self, module: ModuleId, key: &str, begin: DateTime<Utc>)
    -> Result<()>;

    // --- Stamps and detections ---

    fn stamp_exists(&mut self, stamp_id: i64) -> Result<bool>;

    fn create_stamp(&mut self, stamp_id: i64) -> Result<()>;

    fn insert_detection(&mut self, detection: &Detection) -> Result<()>;

    /// Detections of `module` ordered by time.
    fn detections(&mut self, module: ModuleId) -> Result<Vec<Detection>>;

    /// Retention cleanup across all modules; returns the number removed.
    fn delete_detections_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize>;

    // --- Acquisition markers ---

    fn acquisition_marker(
        &mut self,
        module: ModuleId,
        command: Command,
    ) -> Result<Option<AcquisitionMarker>>;

    fn set_acquisition_marker(
        &mut self,
        module: ModuleId,
        command: Command,
        marker: &AcquisitionMarker,
    ) -> Result<()>;

    // --- Import log ---

    fn log_import(&mut self, entry: &ImportLogEntry) -> Result<()>;

    fn import_log(&mut self, module: ModuleId) -> Result<Vec<ImportLogEntry>>;
}

/// A transactional backend shared by every scheduler.
pub trait Store: Send + Sync {
    /// Run `f` inside one transaction; commit on `Ok`, roll back on `Err`.
    fn transaction<T, F>(&self, name: &str, isolation: Isolation, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>;

    /// Read-only convenience wrapper at the default isolation.
    fn read<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>,
    {
        self.transaction(name, Isolation::ReadCommitted, f)
    }
}

impl<S: Store> Store for Arc<S> {
    fn transaction<T, F>(&self, name: &str, isolation: Isolation, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>,
    {
        (**self).transaction(name, isolation, f)
    }
}
