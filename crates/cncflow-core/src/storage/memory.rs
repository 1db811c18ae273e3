//! In-memory store with copy-on-write transactions.
//!
//! A transaction works on a clone of the committed state and swaps it in on
//! success, so a failing closure (or an injected commit failure) leaves the
//! committed state untouched. Transactions are serialized by one mutex.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::trace;

use super::{Isolation, Store, StoreTx};
use crate::error::{Result, StorageError};
use crate::model::{
    AcquisitionMarker, AlarmInterval, AlarmKey, Detection, DetectionKind, ImportLogEntry, IntervalKind,
    StateInterval, VariableRecord,
};
use crate::record::{Command, ModuleId};

/// Committed contents of a [`MemoryStore`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySnapshot {
    pub intervals: HashMap<(IntervalKind, ModuleId), BTreeMap<DateTime<Utc>, StateInterval>>,
    pub alarms: HashMap<ModuleId, BTreeMap<(AlarmKey, DateTime<Utc>), AlarmInterval>>,
    pub variables: HashMap<(ModuleId, String), BTreeMap<DateTime<Utc>, VariableRecord>>,
    pub stamps: BTreeSet<i64>,
    pub detections: Vec<Detection>,
    pub markers: HashMap<(ModuleId, Command), AcquisitionMarker>,
    pub import_log: Vec<ImportLogEntry>,
}

#[derive(Debug, Default)]
struct Inner {
    committed: MemorySnapshot,
    commit_failures: VecDeque<StorageError>,
    commits: u64,
    rollbacks: u64,
}

/// Reference [`Store`] backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next commit with `error` (after the closure ran).
    pub fn fail_next_commit(&self, error: StorageError) {
        self.lock().commit_failures.push_back(error);
    }

    /// Fail the next `count` commits with clones of `error`.
    pub fn fail_next_commits(&self, count: usize, error: StorageError) {
        let mut inner = self.lock();
        for _ in 0..count {
            inner.commit_failures.push_back(error.clone());
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        self.lock().committed.clone()
    }

    /// Pre-register a stamp, as an external configuration tool would.
    pub fn add_stamp(&self, stamp_id: i64) {
        self.lock().committed.stamps.insert(stamp_id);
    }

    pub fn commit_count(&self) -> u64 {
        self.lock().commits
    }

    pub fn rollback_count(&self) -> u64 {
        self.lock().rollbacks
    }
}

impl Store for MemoryStore {
    fn transaction<T, F>(&self, name: &str, isolation: Isolation, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T>,
    {
        let mut inner = self.lock();
        let mut tx = MemoryTx {
            state: inner.committed.clone(),
        };
        trace!(transaction = name, ?isolation, "Begin memory transaction");

        let value = match f(&mut tx) {
            Ok(value) => value,
            Err(e) => {
                inner.rollbacks += 1;
                return Err(e);
            }
        };
        if let Some(error) = inner.commit_failures.pop_front() {
            inner.rollbacks += 1;
            return Err(error.into());
        }
        inner.committed = tx.state;
        inner.commits += 1;
        Ok(value)
    }
}

struct MemoryTx {
    state: MemorySnapshot,
}

impl StoreTx for MemoryTx {
    fn last_interval(
        &mut self,
        kind: IntervalKind,
        module: ModuleId,
    ) -> Result<Option<StateInterval>> {
        Ok(self
            .state
            .intervals
            .get(&(kind, module))
            .and_then(|m| m.values().next_back().cloned()))
    }

    fn upsert_interval(
        &mut self,
        kind: IntervalKind,
        module: ModuleId,
        interval: &StateInterval,
    ) -> Result<()> {
        self.state
            .intervals
            .entry((kind, module))
            .or_default()
            .insert(interval.begin, interval.clone());
        Ok(())
    }

    fn intervals(&mut self, kind: IntervalKind, module: ModuleId) -> Result<Vec<StateInterval>> {
        Ok(self
            .state
            .intervals
            .get(&(kind, module))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn open_alarms(&mut self, module: ModuleId) -> Result<Vec<AlarmInterval>> {
        Ok(self
            .state
            .alarms
            .get(&module)
            .map(|m| m.values().filter(|a| a.open).cloned().collect())
            .unwrap_or_default())
    }

    fn last_alarm(&mut self, module: ModuleId, key: &AlarmKey) -> Result<Option<AlarmInterval>> {
        Ok(self.state.alarms.get(&module).and_then(|m| {
            m.values()
                .filter(|a| &a.key == key)
                .max_by_key(|a| a.begin)
                .cloned()
        }))
    }

    fn upsert_alarm(&mut self, module: ModuleId, alarm: &AlarmInterval) -> Result<()> {
        self.state
            .alarms
            .entry(module)
            .or_default()
            .insert((alarm.key.clone(), alarm.begin), alarm.clone());
        Ok(())
    }

    fn alarms(&mut self, module: ModuleId) -> Result<Vec<AlarmInterval>> {
        Ok(self
            .state
            .alarms
            .get(&module)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn current_variable(
        &mut self,
        module: ModuleId,
        key: &str,
    ) -> Result<Option<VariableRecord>> {
        Ok(self
            .state
            .variables
            .get(&(module, key.to_string()))
            .and_then(|m| m.values().next_back().cloned()))
    }

    fn variables(&mut self, module: ModuleId, key: &str) -> Result<Vec<VariableRecord>> {
        Ok(self
            .state
            .variables
            .get(&(module, key.to_string()))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn variable_keys(&mut self, module: ModuleId) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .state
            .variables
            .iter()
            .filter(|((m, _), records)| *m == module && !records.is_empty())
            .map(|((_, k), _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn insert_variable(&mut self, module: ModuleId, record: &VariableRecord) -> Result<()> {
        let records = self
            .state
            .variables
            .entry((module, record.key.clone()))
            .or_default();
        if records.contains_key(&record.begin) {
            return Err(StorageError::Database(format!(
                "duplicate variable {}@{}",
                record.key, record.begin
            ))
            .into());
        }
        records.insert(record.begin, record.clone());
        Ok(())
    }

    fn set_variable_end(
        &mut self,
        module: ModuleId,
        key: &str,
        begin: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let record = self
            .state
            .variables
            .get_mut(&(module, key.to_string()))
            .and_then(|m| m.get_mut(&begin))
            .ok_or_else(|| StorageError::NotFound(format!("variable {key}@{begin}")))?;
        record.end = end;
        Ok(())
    }

    fn delete_variable(
        &mut self,
        module: ModuleId,
        key: &str,
        begin: DateTime<Utc>,
    ) -> Result<()> {
        let map_key = (module, key.to_string());
        if let Some(records) = self.state.variables.get_mut(&map_key) {
            records.remove(&begin);
            if records.is_empty() {
                self.state.variables.remove(&map_key);
            }
        }
        Ok(())
    }

    fn stamp_exists(&mut self, stamp_id: i64) -> Result<bool> {
        Ok(self.state.stamps.contains(&stamp_id))
    }

    fn create_stamp(&mut self, stamp_id: i64) -> Result<()> {
        self.state.stamps.insert(stamp_id);
        Ok(())
    }

    fn insert_detection(&mut self, detection: &Detection) -> Result<()> {
        if let DetectionKind::Stamp { stamp_id } = detection.kind {
            if !self.state.stamps.contains(&stamp_id) {
                return Err(StorageError::NotFound(format!("stamp {stamp_id}")).into());
            }
        }
        self.state.detections.push(detection.clone());
        Ok(())
    }

    fn detections(&mut self, module: ModuleId) -> Result<Vec<Detection>> {
        let mut found: Vec<Detection> = self
            .state
            .detections
            .iter()
            .filter(|d| d.module == module)
            .cloned()
            .collect();
        found.sort_by_key(|d| d.at);
        Ok(found)
    }

    fn delete_detections_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.state.detections.len();
        self.state.detections.retain(|d| d.at >= cutoff);
        Ok(before - self.state.detections.len())
    }

    fn acquisition_marker(
        &mut self,
        module: ModuleId,
        command: Command,
    ) -> Result<Option<AcquisitionMarker>> {
        Ok(self.state.markers.get(&(module, command)).cloned())
    }

    fn set_acquisition_marker(
        &mut self,
        module: ModuleId,
        command: Command,
        marker: &AcquisitionMarker,
    ) -> Result<()> {
        self.state.markers.insert((module, command), marker.clone());
        Ok(())
    }

    fn log_import(&mut self, entry: &ImportLogEntry) -> Result<()> {
        self.state.import_log.push(entry.clone());
        Ok(())
    }

    fn import_log(&mut self, module: ModuleId) -> Result<Vec<ImportLogEntry>> {
        Ok(self
            .state
            .import_log
            .iter()
            .filter(|e| e.module == module)
            .cloned()
            .collect())
    }
}
