//! Consolidation strategies, one per command kind.
//!
//! Every strategy implements [`Consolidate`]: an eligibility predicate used
//! by the batcher, and `apply`, which turns one homogeneous batch into
//! storage writes inside a single transaction. Strategies that cache storage
//! state reload it whenever that transaction fails.

mod alarm;
mod append;
mod interval;
mod variable;

pub use alarm::AlarmStrategy;
pub use append::{MilestoneStrategy, StampStrategy};
pub use interval::{GapPolicy, IntervalStrategy};
pub use variable::VariableStrategy;

use chrono::TimeDelta;
use serde::de::DeserializeOwned;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::import_log;
use crate::model::ImportLogLevel;
use crate::record::{Command, DataRecord, ModuleId};
use crate::storage::Store;

/// What one `apply` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Entity rows inserted, updated or deleted.
    pub writes: usize,
    /// Anomalies written to the import log.
    pub anomalies: usize,
    /// The batch was already consolidated (at-least-once redelivery).
    pub replayed: bool,
    /// The batch could never succeed (bad payload, unknown stamp) and was dropped.
    pub discarded: bool,
}

impl ApplyReport {
    #[must_use]
    pub fn replay() -> Self {
        Self {
            replayed: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn discarded(anomalies: usize) -> Self {
        Self {
            discarded: true,
            anomalies,
            ..Self::default()
        }
    }
}

/// Shared contract of the per-command strategies.
pub trait Consolidate<S: Store> {
    fn command(&self) -> Command;

    /// May `candidate` join a batch whose last record is `tail`?
    fn is_compatible(&self, tail: &DataRecord, candidate: &DataRecord) -> bool;

    /// Consolidate one batch produced by the batcher.
    fn apply(&mut self, batch: &[DataRecord], store: &S, cancel: &CancelToken)
    -> Result<ApplyReport>;
}

/// Common prefix of every eligibility rule: same stream, no regression, gap within bounds.
pub(crate) fn within_gap(tail: &DataRecord, candidate: &DataRecord, max_gap: TimeDelta) -> bool {
    tail.same_stream(candidate)
        && candidate.timestamp >= tail.timestamp
        && candidate.timestamp - tail.timestamp <= max_gap
}

/// Decode a record payload for `command`.
pub(crate) fn decode<T: DeserializeOwned>(record: &DataRecord) -> Result<T> {
    serde_json::from_value(record.value.clone())
        .map_err(|e| Error::payload(record.command, e.to_string()))
}

/// Decode the payload of `record`, or report it and tell the caller to drop the batch.
pub(crate) fn decode_or_discard<T, S>(
    record: &DataRecord,
    module: ModuleId,
    store: &S,
) -> Result<Option<T>>
where
    T: DeserializeOwned,
    S: Store,
{
    match decode(record) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            import_log::report_detached(
                store,
                module,
                record.command,
                record.timestamp,
                ImportLogLevel::Error,
                format!("{e}; batch dropped"),
            )?;
            Ok(None)
        }
    }
}

/// First and last record of a non-empty batch.
pub(crate) fn bounds(batch: &[DataRecord]) -> Result<(&DataRecord, &DataRecord)> {
    match (batch.first(), batch.last()) {
        (Some(first), Some(last)) => Ok((first, last)),
        _ => Err(Error::Invariant("strategy received an empty batch".to_string())),
    }
}
