//! Keyed time series for CNC variable snapshots.
//!
//! A `variables` record maps variable keys to their current value. Each key
//! owns a chain of non-overlapping `[begin, end)` records; the last one is
//! open-ended while the variable is tracked. A `null` value stops tracking.
//! Points that land before already stored data are back-corrected: later
//! records are dropped and the record containing the point is truncated.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{ApplyReport, Consolidate, bounds, decode_or_discard, within_gap};
use crate::cache::StateCache;
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::import_log;
use crate::model::{ImportLogLevel, VariableRecord};
use crate::record::{Command, DataRecord, ModuleId};
use crate::storage::{Isolation, Store, StoreTx};

#[derive(Debug)]
pub struct VariableStrategy {
    module: ModuleId,
    max_gap: TimeDelta,
    current: StateCache<String, VariableRecord>,
}

impl VariableStrategy {
    #[must_use]
    pub fn new(module: ModuleId, max_gap: TimeDelta) -> Self {
        Self {
            module,
            max_gap,
            current: StateCache::new(),
        }
    }

    /// Latest cached record for `key`; `None` if unknown or untracked.
    pub fn cached(&mut self, key: &str) -> Option<&VariableRecord> {
        self.current.get(&key.to_string()).flatten()
    }

    fn recover<S: Store>(&mut self, store: &S, touched: &BTreeSet<String>) {
        let module = self.module;
        for key in touched {
            let reloaded = self.current.reload(key, |k| {
                store.read("variable_reload", |tx| tx.current_variable(module, k))
            });
            if let Err(e) = reloaded {
                warn!(
                    module_id = %module,
                    variable = %key,
                    error = %e,
                    "Variable reload failed; it will be re-read on the next batch"
                );
            }
        }
        debug!(module_id = %module, keys = touched.len(), "Reloaded variables after failed write");
    }
}

fn open_record(key: &str, payload: &Value, begin: DateTime<Utc>) -> VariableRecord {
    VariableRecord {
        key: key.to_string(),
        payload: payload.clone(),
        begin,
        end: None,
    }
}

/// Rewrite the history of `key` so that `value` takes effect at `at`.
fn back_correct(
    tx: &mut dyn StoreTx,
    module: ModuleId,
    key: &str,
    value: &Value,
    at: DateTime<Utc>,
) -> Result<usize> {
    let mut writes = 0;
    let history = tx.variables(module, key)?;
    for later in history.iter().filter(|r| r.begin >= at) {
        tx.delete_variable(module, key, later.begin)?;
        writes += 1;
    }

    let mut insert = !value.is_null();
    if let Some(containing) = history.iter().find(|r| r.begin < at && r.contains(at)) {
        if insert && containing.payload == *value {
            tx.set_variable_end(module, key, containing.begin, None)?;
            insert = false;
        } else {
            tx.set_variable_end(module, key, containing.begin, Some(at))?;
        }
        writes += 1;
    }
    if insert {
        tx.insert_variable(module, &open_record(key, value, at))?;
        writes += 1;
    }
    Ok(writes)
}

/// Fold the value of one key observed at `at` into storage.
fn track(
    tx: &mut dyn StoreTx,
    cache: &mut StateCache<String, VariableRecord>,
    module: ModuleId,
    key: &String,
    value: &Value,
    at: DateTime<Utc>,
    report: &mut ApplyReport,
) -> Result<()> {
    let current = cache
        .get_or_load(key, |k| tx.current_variable(module, k))?
        .cloned();

    let Some(mut current) = current else {
        if !value.is_null() {
            let fresh = open_record(key, value, at);
            tx.insert_variable(module, &fresh)?;
            report.writes += 1;
            cache.insert(key.clone(), fresh);
        }
        return Ok(());
    };

    if at < current.begin || current.end.is_some_and(|end| at < end) {
        report.writes += back_correct(tx, module, key, value, at)?;
        import_log::report(
            tx,
            module,
            Command::Variables,
            at,
            ImportLogLevel::Warning,
            format!(
                "variable {key} at {at} precedes stored data from {}; history corrected",
                current.begin
            ),
        )?;
        report.anomalies += 1;
        cache.reload(key, |k| tx.current_variable(module, k))?;
        return Ok(());
    }

    if value.is_null() {
        if current.is_open() {
            if at == current.begin {
                tx.delete_variable(module, key, current.begin)?;
                cache.reload(key, |k| tx.current_variable(module, k))?;
            } else {
                tx.set_variable_end(module, key, current.begin, Some(at))?;
                current.end = Some(at);
                cache.insert(key.clone(), current);
            }
            report.writes += 1;
        }
        return Ok(());
    }

    if !current.is_open() {
        let fresh = open_record(key, value, at);
        tx.insert_variable(module, &fresh)?;
        report.writes += 1;
        cache.insert(key.clone(), fresh);
        return Ok(());
    }

    if current.payload == *value {
        return Ok(());
    }

    if at == current.begin {
        tx.delete_variable(module, key, current.begin)?;
    } else {
        tx.set_variable_end(module, key, current.begin, Some(at))?;
    }
    let fresh = open_record(key, value, at);
    tx.insert_variable(module, &fresh)?;
    report.writes += 2;
    cache.insert(key.clone(), fresh);
    Ok(())
}

impl<S: Store> Consolidate<S> for VariableStrategy {
    fn command(&self) -> Command {
        Command::Variables
    }

    fn is_compatible(&self, tail: &DataRecord, candidate: &DataRecord) -> bool {
        within_gap(tail, candidate, self.max_gap) && tail.value == candidate.value
    }

    fn apply(
        &mut self,
        batch: &[DataRecord],
        store: &S,
        cancel: &CancelToken,
    ) -> Result<ApplyReport> {
        let (first, _) = bounds(batch)?;
        let Some(snapshot) = decode_or_discard::<Map<String, Value>, S>(first, self.module, store)?
        else {
            return Ok(ApplyReport::discarded(1));
        };

        let module = self.module;
        let at = first.timestamp;
        let cache = &mut self.current;
        let mut touched = BTreeSet::new();
        let result = store.transaction("variables", Isolation::ReadCommitted, |tx| {
            let mut report = ApplyReport::default();
            for (key, value) in &snapshot {
                cancel.check("variable consolidation")?;
                touched.insert(key.clone());
                track(tx, cache, module, key, value, at, &mut report)?;
            }
            Ok(report)
        });

        match result {
            Ok(report) => Ok(report),
            Err(e) => {
                self.recover(store, &touched);
                Err(e)
            }
        }
    }
}
