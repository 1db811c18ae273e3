//! Append-only detections: stamps and sequence milestones.
//!
//! Every accepted batch appends one detection and moves the acquisition
//! marker for its command to the batch's last record. Batches the marker
//! already covers were consolidated before and are skipped.

use chrono::TimeDelta;
use serde::Deserialize;
use tracing::debug;

use super::{ApplyReport, Consolidate, bounds, decode_or_discard, within_gap};
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::import_log;
use crate::model::{AcquisitionMarker, Detection, DetectionKind, ImportLogLevel};
use crate::record::{Command, DataRecord, ModuleId};
use crate::storage::{Isolation, Store, StoreTx};

fn is_replay(
    tx: &mut dyn StoreTx,
    module: ModuleId,
    command: Command,
    last: &DataRecord,
) -> Result<bool> {
    Ok(tx
        .acquisition_marker(module, command)?
        .is_some_and(|marker| marker.covers(last)))
}

/// Stamp detections; the referenced stamp must already exist unless
/// auto-creation is enabled.
#[derive(Debug)]
pub struct StampStrategy {
    module: ModuleId,
    max_gap: TimeDelta,
    auto_create: bool,
}

impl StampStrategy {
    #[must_use]
    pub fn new(module: ModuleId, max_gap: TimeDelta, auto_create: bool) -> Self {
        Self {
            module,
            max_gap,
            auto_create,
        }
    }
}

impl<S: Store> Consolidate<S> for StampStrategy {
    fn command(&self) -> Command {
        Command::Stamp
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
        let (first, last) = bounds(batch)?;
        let Some(stamp_id) = decode_or_discard::<i64, S>(first, self.module, store)? else {
            return Ok(ApplyReport::discarded(1));
        };
        cancel.check("stamp detection")?;

        let module = self.module;
        let auto_create = self.auto_create;
        store.transaction("stamp", Isolation::ReadCommitted, |tx| {
            if is_replay(tx, module, Command::Stamp, last)? {
                return Ok(ApplyReport::replay());
            }

            let mut report = ApplyReport::default();
            if !tx.stamp_exists(stamp_id)? {
                if !auto_create {
                    import_log::report(
                        tx,
                        module,
                        Command::Stamp,
                        first.timestamp,
                        ImportLogLevel::Error,
                        format!("unknown stamp {stamp_id}; {} records skipped", batch.len()),
                    )?;
                    return Ok(ApplyReport::discarded(1));
                }
                tx.create_stamp(stamp_id)?;
                report.writes += 1;
                debug!(module_id = %module, stamp_id, "Created stamp on first detection");
            }

            tx.insert_detection(&Detection {
                module,
                at: first.timestamp,
                kind: DetectionKind::Stamp { stamp_id },
            })?;
            tx.set_acquisition_marker(module, Command::Stamp, &AcquisitionMarker::of(last))?;
            report.writes += 2;
            Ok(report)
        })
    }
}

#[derive(Debug, Deserialize)]
struct MilestonePayload {
    sequence: i64,
    milestone_secs: f64,
}

/// Sequence milestones; only the last record of a batch matters.
#[derive(Debug)]
pub struct MilestoneStrategy {
    module: ModuleId,
}

impl MilestoneStrategy {
    #[must_use]
    pub fn new(module: ModuleId) -> Self {
        Self { module }
    }
}

impl<S: Store> Consolidate<S> for MilestoneStrategy {
    fn command(&self) -> Command {
        Command::Milestone
    }

    fn is_compatible(&self, tail: &DataRecord, candidate: &DataRecord) -> bool {
        tail.same_stream(candidate) && candidate.timestamp >= tail.timestamp
    }

    fn apply(
        &mut self,
        batch: &[DataRecord],
        store: &S,
        cancel: &CancelToken,
    ) -> Result<ApplyReport> {
        let (_, last) = bounds(batch)?;
        let Some(payload) = decode_or_discard::<MilestonePayload, S>(last, self.module, store)?
        else {
            return Ok(ApplyReport::discarded(1));
        };
        cancel.check("milestone detection")?;

        let module = self.module;
        store.transaction("milestone", Isolation::ReadCommitted, |tx| {
            if is_replay(tx, module, Command::Milestone, last)? {
                return Ok(ApplyReport::replay());
            }
            tx.insert_detection(&Detection {
                module,
                at: last.timestamp,
                kind: DetectionKind::Milestone {
                    sequence: payload.sequence,
                    milestone_secs: payload.milestone_secs,
                },
            })?;
            tx.set_acquisition_marker(module, Command::Milestone, &AcquisitionMarker::of(last))?;
            Ok(ApplyReport {
                writes: 2,
                ..ApplyReport::default()
            })
        })
    }
}
