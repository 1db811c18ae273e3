//! Interval extension for machine-mode facts and module activity periods.
//!
//! One open interval per module lives in a [`CachedSlot`]. A batch either
//! extends it, closes it and opens a new one, or (past the max gap) leaves
//! it as-is and starts over, optionally persisting a filler interval so the
//! activity timeline has no silent holes.

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use super::{ApplyReport, Consolidate, bounds, decode_or_discard, within_gap};
use crate::cache::CachedSlot;
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::import_log;
use crate::model::{ImportLogLevel, IntervalKind, StateId, StateInterval};
use crate::record::{Command, DataRecord, ModuleId};
use crate::storage::{Isolation, Store, StoreTx};

/// What to do with the time between two intervals separated by more than the max gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapPolicy {
    /// Leave the gap unrepresented.
    LeaveHole,
    /// Persist an explicit interval with this state.
    FillWith(StateId),
}

#[derive(Debug)]
pub struct IntervalStrategy {
    kind: IntervalKind,
    module: ModuleId,
    max_gap: TimeDelta,
    gap_policy: GapPolicy,
    open: CachedSlot<StateInterval>,
}

impl IntervalStrategy {
    #[must_use]
    pub fn new(kind: IntervalKind, module: ModuleId, max_gap: TimeDelta, gap_policy: GapPolicy) -> Self {
        Self {
            kind,
            module,
            max_gap,
            gap_policy,
            open: CachedSlot::new(),
        }
    }

    /// Machine-mode facts: gaps are left unrepresented.
    #[must_use]
    pub fn machine_mode(module: ModuleId, max_gap: TimeDelta) -> Self {
        Self::new(IntervalKind::MachineMode, module, max_gap, GapPolicy::LeaveHole)
    }

    /// Activity periods: gaps are filled with `default_state`.
    #[must_use]
    pub fn module_activity(module: ModuleId, max_gap: TimeDelta, default_state: StateId) -> Self {
        Self::new(
            IntervalKind::ModuleActivity,
            module,
            max_gap,
            GapPolicy::FillWith(default_state),
        )
    }

    /// The open interval as currently cached (not read from storage).
    pub fn open_interval(&self) -> Option<&StateInterval> {
        self.open.peek()
    }

    /// Drop the cached interval so the next batch re-reads storage.
    pub fn invalidate(&mut self) {
        self.open.invalidate();
    }

    fn recover<S: Store>(&mut self, store: &S) {
        let (kind, module) = (self.kind, self.module);
        match self
            .open
            .reload(|| store.read("interval_reload", |tx| tx.last_interval(kind, module)))
        {
            Ok(()) => debug!(module_id = %module, %kind, "Reloaded open interval after failed write"),
            Err(e) => warn!(
                module_id = %module,
                %kind,
                error = %e,
                "Open interval reload failed; it will be re-read on the next batch"
            ),
        }
    }
}

/// Immutable inputs of one consolidation step.
struct Step {
    kind: IntervalKind,
    module: ModuleId,
    max_gap: TimeDelta,
    gap_policy: GapPolicy,
    state: StateId,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
}

fn persist(tx: &mut dyn StoreTx, step: &Step, interval: &StateInterval) -> Result<usize> {
    if interval.is_persistable() {
        tx.upsert_interval(step.kind, step.module, interval)?;
        Ok(1)
    } else {
        Ok(0)
    }
}

/// Apply one batch to the open interval; returns the new open interval.
fn consolidate(
    tx: &mut dyn StoreTx,
    step: &Step,
    current: Option<StateInterval>,
) -> Result<(StateInterval, ApplyReport)> {
    let mut report = ApplyReport::default();

    let Some(mut open) = current else {
        let fresh = StateInterval::new(step.begin, step.end, step.state);
        report.writes += persist(tx, step, &fresh)?;
        return Ok((fresh, report));
    };

    let mut begin = step.begin;
    if begin < open.end {
        if step.state == open.state && step.end <= open.end {
            return Ok((open, ApplyReport::replay()));
        }
        if step.state != open.state {
            import_log::report(
                tx,
                step.module,
                step.kind.command(),
                begin,
                ImportLogLevel::Warning,
                format!(
                    "{} state {} at {begin} overlaps the open interval [{}, {}) with state {}",
                    step.kind, step.state, open.begin, open.end, open.state
                ),
            )?;
            report.anomalies += 1;
            if step.end <= open.end {
                return Ok((open, report));
            }
        }
        begin = open.end;
    }

    let gap = begin - open.end;
    if gap <= step.max_gap {
        if step.state == open.state {
            open.end = step.end;
            report.writes += persist(tx, step, &open)?;
            return Ok((open, report));
        }
        open.end = begin;
        report.writes += persist(tx, step, &open)?;
    } else if let GapPolicy::FillWith(filler_state) = step.gap_policy {
        let filler = StateInterval::new(open.end, begin, filler_state);
        debug!(
            module_id = %step.module,
            kind = %step.kind,
            begin = %filler.begin,
            end = %filler.end,
            state = filler_state,
            "Filling gap with default state"
        );
        report.writes += persist(tx, step, &filler)?;
    }

    let fresh = StateInterval::new(begin, step.end, step.state);
    report.writes += persist(tx, step, &fresh)?;
    Ok((fresh, report))
}

impl<S: Store> Consolidate<S> for IntervalStrategy {
    fn command(&self) -> Command {
        self.kind.command()
    }

    fn is_compatible(&self, tail: &DataRecord, candidate: &DataRecord) -> bool {
        within_gap(tail, candidate, self.max_gap) && tail.same_content(candidate)
    }

    fn apply(
        &mut self,
        batch: &[DataRecord],
        store: &S,
        cancel: &CancelToken,
    ) -> Result<ApplyReport> {
        let (first, last) = bounds(batch)?;
        let Some(state) = decode_or_discard::<StateId, S>(first, self.module, store)? else {
            return Ok(ApplyReport::discarded(1));
        };
        cancel.check("interval consolidation")?;

        let step = Step {
            kind: self.kind,
            module: self.module,
            max_gap: self.max_gap,
            gap_policy: self.gap_policy,
            state,
            begin: first.timestamp,
            end: last.timestamp,
        };
        let slot = &mut self.open;
        let result = store.transaction(step.kind.as_str(), Isolation::ReadCommitted, |tx| {
            let current = slot
                .get_or_load(|| tx.last_interval(step.kind, step.module))?
                .cloned();
            let (next, report) = consolidate(tx, &step, current)?;
            slot.set(Some(next));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, StorageError};
    use crate::storage::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    const M: ModuleId = ModuleId(1);
    const ACTIVE: i64 = 2;
    const INACTIVE: i64 = 1;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn mode(secs: i64, state: i64) -> DataRecord {
        DataRecord::new(Command::MachineMode, M, "", json!(state), at(secs))
    }

    fn persisted(store: &MemoryStore, kind: IntervalKind) -> Vec<StateInterval> {
        store.read("r", |tx| tx.intervals(kind, M)).unwrap()
    }

    fn apply(strategy: &mut IntervalStrategy, store: &MemoryStore, batch: &[DataRecord]) -> ApplyReport {
        Consolidate::<MemoryStore>::apply(strategy, batch, store, &CancelToken::new()).unwrap()
    }

    #[test]
    fn active_then_inactive_scenario() {
        let store = MemoryStore::new();
        let mut s = IntervalStrategy::machine_mode(M, TimeDelta::seconds(60));
        let compat = |a: &DataRecord, b: &DataRecord| {
            Consolidate::<MemoryStore>::is_compatible(&s, a, b)
        };
        assert!(compat(&mode(0, ACTIVE), &mode(30, ACTIVE)));
        assert!(!compat(&mode(30, ACTIVE), &mode(90, INACTIVE)));

        apply(&mut s, &store, &[mode(0, ACTIVE), mode(30, ACTIVE)]);
        apply(&mut s, &store, &[mode(90, INACTIVE)]);

        assert_eq!(
            persisted(&store, IntervalKind::MachineMode),
            vec![StateInterval::new(at(0), at(90), ACTIVE)]
        );
        assert_eq!(
            s.open_interval(),
            Some(&StateInterval::new(at(90), at(90), INACTIVE))
        );
    }

    #[test]
    fn exactly_max_gap_extends() {
        let store = MemoryStore::new();
        let mut s = IntervalStrategy::machine_mode(M, TimeDelta::seconds(60));
        apply(&mut s, &store, &[mode(0, ACTIVE), mode(10, ACTIVE)]);
        apply(&mut s, &store, &[mode(70, ACTIVE)]);
        assert_eq!(
            persisted(&store, IntervalKind::MachineMode),
            vec![StateInterval::new(at(0), at(70), ACTIVE)]
        );
    }

    #[test]
    fn beyond_max_gap_starts_fresh() {
        let store = MemoryStore::new();
        let mut s = IntervalStrategy::machine_mode(M, TimeDelta::seconds(60));
        apply(&mut s, &store, &[mode(0, ACTIVE), mode(10, ACTIVE)]);
        let late = DataRecord::new(
            Command::MachineMode,
            M,
            "",
            json!(ACTIVE),
            at(70) + TimeDelta::milliseconds(1),
        );
        apply(&mut s, &store, &[late.clone(), mode(80, ACTIVE)]);
        assert_eq!(
            persisted(&store, IntervalKind::MachineMode),
            vec![
                StateInterval::new(at(0), at(10), ACTIVE),
                StateInterval::new(late.timestamp, at(80), ACTIVE),
            ]
        );
    }

    #[test]
    fn activity_gap_is_filled_with_default_state() {
        let store = MemoryStore::new();
        let mut s = IntervalStrategy::module_activity(M, TimeDelta::seconds(60), 0);
        let act = |secs, state| {
            DataRecord::new(Command::ModuleActivity, M, "", json!(state), at(secs))
        };
        apply(&mut s, &store, &[act(0, ACTIVE), act(20, ACTIVE)]);
        apply(&mut s, &store, &[act(200, INACTIVE), act(230, INACTIVE)]);
        assert_eq!(
            persisted(&store, IntervalKind::ModuleActivity),
            vec![
                StateInterval::new(at(0), at(20), ACTIVE),
                StateInterval::new(at(20), at(200), 0),
                StateInterval::new(at(200), at(230), INACTIVE),
            ]
        );
    }

    #[test]
    fn sub_second_interval_is_not_persisted() {
        let store = MemoryStore::new();
        let mut s = IntervalStrategy::machine_mode(M, TimeDelta::seconds(60));
        let report = apply(&mut s, &store, &[mode(0, ACTIVE)]);
        assert_eq!(report.writes, 0);
        assert!(persisted(&store, IntervalKind::MachineMode).is_empty());
        assert!(s.open_interval().is_some());
    }

    #[test]
    fn replayed_batch_is_a_no_op() {
        let store = MemoryStore::new();
        let mut s = IntervalStrategy::machine_mode(M, TimeDelta::seconds(60));
        let batch = [mode(0, ACTIVE), mode(30, ACTIVE)];
        apply(&mut s, &store, &batch);
        let before = store.snapshot();
        let report = apply(&mut s, &store, &batch);
        assert!(report.replayed);
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn overlapping_state_change_is_reported() {
        let store = MemoryStore::new();
        let mut s = IntervalStrategy::machine_mode(M, TimeDelta::seconds(60));
        apply(&mut s, &store, &[mode(0, ACTIVE), mode(30, ACTIVE)]);
        let report = apply(&mut s, &store, &[mode(10, INACTIVE), mode(20, INACTIVE)]);
        assert_eq!(report.anomalies, 1);
        assert_eq!(
            persisted(&store, IntervalKind::MachineMode),
            vec![StateInterval::new(at(0), at(30), ACTIVE)]
        );
        assert_eq!(store.snapshot().import_log.len(), 1);
    }

    #[test]
    fn undecodable_state_is_discarded() {
        let store = MemoryStore::new();
        let mut s = IntervalStrategy::machine_mode(M, TimeDelta::seconds(60));
        let bad = DataRecord::new(Command::MachineMode, M, "", json!("idle"), at(0));
        let report = apply(&mut s, &store, &[bad]);
        assert!(report.discarded);
        assert_eq!(store.snapshot().import_log.len(), 1);
    }

    #[test]
    fn failed_commit_reloads_open_interval_from_storage() {
        let store = MemoryStore::new();
        let mut s = IntervalStrategy::machine_mode(M, TimeDelta::seconds(60));
        apply(&mut s, &store, &[mode(0, ACTIVE), mode(30, ACTIVE)]);

        store.fail_next_commit(StorageError::Database("disk full".into()));
        let err = Consolidate::<MemoryStore>::apply(
            &mut s,
            &[mode(45, ACTIVE)],
            &store,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(
            s.open_interval(),
            Some(&StateInterval::new(at(0), at(30), ACTIVE))
        );
    }

    #[test]
    fn open_interval_is_loaded_from_storage() {
        let store = MemoryStore::new();
        {
            let mut first = IntervalStrategy::machine_mode(M, TimeDelta::seconds(60));
            apply(&mut first, &store, &[mode(0, ACTIVE), mode(30, ACTIVE)]);
        }
        let mut restarted = IntervalStrategy::machine_mode(M, TimeDelta::seconds(60));
        apply(&mut restarted, &store, &[mode(50, ACTIVE)]);
        assert_eq!(
            persisted(&store, IntervalKind::MachineMode),
            vec![StateInterval::new(at(0), at(50), ACTIVE)]
        );
    }

    #[test]
    fn cancellation_before_write() {
        let store = MemoryStore::new();
        let mut s = IntervalStrategy::machine_mode(M, TimeDelta::seconds(60));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = Consolidate::<MemoryStore>::apply(&mut s, &[mode(0, ACTIVE)], &store, &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert_eq!(store.commit_count(), 0);
    }
}
