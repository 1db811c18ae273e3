//! State-set diffing for alarm snapshots.
//!
//! Each `alarms` record carries the complete set of currently active alarms.
//! Keys present in a batch extend (or open) their interval; keys missing from
//! it are closed at their last observed end.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use super::{ApplyReport, Consolidate, bounds, decode, decode_or_discard, within_gap};
use crate::cache::StateCache;
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::import_log;
use crate::model::{AcquisitionMarker, AlarmInterval, AlarmKey, AlarmObservation, ImportLogLevel};
use crate::record::{Command, DataRecord, ModuleId};
use crate::storage::{Isolation, Store, StoreTx};

#[derive(Debug)]
pub struct AlarmStrategy {
    module: ModuleId,
    max_gap: TimeDelta,
    open: StateCache<AlarmKey, AlarmInterval>,
    /// The open set has been read from storage since the last invalidation.
    loaded: bool,
}

/// Observations keyed (and deduplicated) by alarm key.
fn alarm_set(record: &DataRecord) -> Result<BTreeMap<AlarmKey, AlarmObservation>> {
    let observations: Vec<AlarmObservation> = decode(record)?;
    Ok(observations
        .into_iter()
        .map(|obs| (obs.key.clone(), obs))
        .collect())
}

fn load_open_set(
    cache: &mut StateCache<AlarmKey, AlarmInterval>,
    tx: &mut dyn StoreTx,
    module: ModuleId,
) -> Result<()> {
    cache.invalidate_all();
    for alarm in tx.open_alarms(module)? {
        cache.insert(alarm.key.clone(), alarm);
    }
    Ok(())
}

impl AlarmStrategy {
    #[must_use]
    pub fn new(module: ModuleId, max_gap: TimeDelta) -> Self {
        Self {
            module,
            max_gap,
            open: StateCache::new(),
            loaded: false,
        }
    }

    /// Alarms currently believed open, in key order.
    pub fn open_alarms(&self) -> Vec<&AlarmInterval> {
        let mut open: Vec<_> = self.open.values().map(|(_, alarm)| alarm).collect();
        open.sort_by(|a, b| a.key.cmp(&b.key));
        open
    }

    fn recover<S: Store>(&mut self, store: &S) {
        self.open.invalidate_all();
        self.loaded = false;
        let module = self.module;
        let cache = &mut self.open;
        match store.read("alarm_reload", |tx| load_open_set(cache, tx, module)) {
            Ok(()) => {
                self.loaded = true;
                debug!(module_id = %module, open = self.open.len(), "Reloaded open alarms");
            }
            Err(e) => {
                self.open.invalidate_all();
                warn!(
                    module_id = %module,
                    error = %e,
                    "Open alarm reload failed; they will be re-read on the next batch"
                );
            }
        }
    }
}

struct Window {
    module: ModuleId,
    max_gap: TimeDelta,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Fold one observation into its cached interval.
fn observe(
    tx: &mut dyn StoreTx,
    cache: &mut StateCache<AlarmKey, AlarmInterval>,
    window: &Window,
    observation: &AlarmObservation,
    report: &mut ApplyReport,
) -> Result<()> {
    let key = &observation.key;
    let module = window.module;
    let current = cache
        .get_or_load(key, |k| {
            tx.last_alarm(module, k)
                .map(|alarm| alarm.filter(|a| a.open))
        })?
        .cloned();

    let Some(mut current) = current else {
        let fresh = AlarmInterval::opened(observation, window.begin, window.end);
        tx.upsert_alarm(module, &fresh)?;
        report.writes += 1;
        cache.insert(key.clone(), fresh);
        return Ok(());
    };

    if window.end <= current.end {
        return Ok(());
    }
    if current.end > window.begin {
        import_log::report(
            tx,
            module,
            Command::Alarms,
            window.begin,
            ImportLogLevel::Warning,
            format!(
                "alarm {key} observed at {} but already open until {}; skipped",
                window.begin, current.end
            ),
        )?;
        report.anomalies += 1;
        return Ok(());
    }

    if window.begin - current.end > window.max_gap {
        current.open = false;
        tx.upsert_alarm(module, &current)?;
        let fresh = AlarmInterval::opened(observation, window.begin, window.end);
        tx.upsert_alarm(module, &fresh)?;
        report.writes += 2;
        cache.insert(key.clone(), fresh);
    } else if current.message == observation.message
        && current.properties == observation.properties
    {
        current.end = window.end;
        tx.upsert_alarm(module, &current)?;
        report.writes += 1;
        cache.insert(key.clone(), current);
    } else {
        current.end = window.begin;
        current.open = false;
        tx.upsert_alarm(module, &current)?;
        let fresh = AlarmInterval::opened(observation, window.begin, window.end);
        tx.upsert_alarm(module, &fresh)?;
        report.writes += 2;
        cache.insert(key.clone(), fresh);
    }
    Ok(())
}

impl<S: Store> Consolidate<S> for AlarmStrategy {
    fn command(&self) -> Command {
        Command::Alarms
    }

    fn is_compatible(&self, tail: &DataRecord, candidate: &DataRecord) -> bool {
        if !within_gap(tail, candidate, self.max_gap) {
            return false;
        }
        match (alarm_set(tail), alarm_set(candidate)) {
            (Ok(a), Ok(b)) => a == b,
            _ => tail.value == candidate.value,
        }
    }

    fn apply(
        &mut self,
        batch: &[DataRecord],
        store: &S,
        cancel: &CancelToken,
    ) -> Result<ApplyReport> {
        let (first, last) = bounds(batch)?;
        let Some(observations) =
            decode_or_discard::<Vec<AlarmObservation>, S>(first, self.module, store)?
        else {
            return Ok(ApplyReport::discarded(1));
        };
        let observations: BTreeMap<AlarmKey, AlarmObservation> = observations
            .into_iter()
            .map(|obs| (obs.key.clone(), obs))
            .collect();

        let window = Window {
            module: self.module,
            max_gap: self.max_gap,
            begin: first.timestamp,
            end: last.timestamp,
        };
        let cache = &mut self.open;
        let loaded = &mut self.loaded;
        let result = store.transaction("alarms", Isolation::ReadCommitted, |tx| {
            let marker = tx.acquisition_marker(window.module, Command::Alarms)?;
            if marker.is_some_and(|m| m.covers(last)) {
                return Ok(ApplyReport::replay());
            }
            if !*loaded {
                load_open_set(cache, tx, window.module)?;
                *loaded = true;
            }

            let mut report = ApplyReport::default();
            let mut present = HashSet::with_capacity(observations.len());
            for (key, observation) in &observations {
                cancel.check("alarm consolidation")?;
                present.insert(key.clone());
                observe(tx, cache, &window, observation, &mut report)?;
            }

            let cleared: Vec<AlarmInterval> = cache
                .values()
                .filter(|(key, _)| !present.contains(*key))
                .map(|(_, alarm)| alarm.clone())
                .collect();
            for mut alarm in cleared {
                alarm.open = false;
                tx.upsert_alarm(window.module, &alarm)?;
                report.writes += 1;
                cache.remove(&alarm.key);
                debug!(module_id = %window.module, alarm = %alarm.key, end = %alarm.end, "Alarm cleared");
            }
            cache.clear_except(&present);

            tx.set_acquisition_marker(window.module, Command::Alarms, &AcquisitionMarker::of(last))?;
            Ok(report)
        });

        match result {
            Ok(report) => Ok(report),
            Err(e) => {
                self.recover(store);
                Err(e)
            }
        }
    }
}
