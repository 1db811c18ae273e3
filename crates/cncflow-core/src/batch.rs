//! Batcher: the maximal compatible prefix of a peeked window.

use tracing::warn;

use crate::error::{Error, Result};
use crate::record::DataRecord;

/// Return the longest prefix of `window` in which every record is compatible
/// with its predecessor.
///
/// The first record is always accepted, so the prefix is non-empty whenever
/// the window is. A timestamp regression ends the batch and is logged.
pub fn take_batch<F>(window: &[DataRecord], is_compatible: F) -> Result<&[DataRecord]>
where
    F: Fn(&DataRecord, &DataRecord) -> bool,
{
    if window.is_empty() {
        return Ok(window);
    }

    let mut len = 1;
    while len < window.len() {
        let tail = &window[len - 1];
        let candidate = &window[len];
        if candidate.same_stream(tail) && candidate.timestamp < tail.timestamp {
            warn!(
                module_id = %candidate.module_id,
                command = %candidate.command,
                previous = %tail.timestamp,
                timestamp = %candidate.timestamp,
                "Timestamp regression in queue, ending batch"
            );
            break;
        }
        if !is_compatible(tail, candidate) {
            break;
        }
        len += 1;
    }

    let batch = &window[..len];
    if batch.is_empty() {
        return Err(Error::Invariant(
            "batcher produced an empty batch from a non-empty window".to_string(),
        ));
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Command, ModuleId};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn mode(secs: i64, value: i64) -> DataRecord {
        DataRecord::new(Command::MachineMode, ModuleId(1), "", json!(value), at(secs))
    }

    fn same_value(a: &DataRecord, b: &DataRecord) -> bool {
        a.same_stream(b) && a.same_content(b)
    }

    #[test]
    fn empty_window_gives_empty_batch() {
        assert!(take_batch(&[], same_value).unwrap().is_empty());
    }

    #[test]
    fn first_record_always_accepted() {
        let window = [mode(0, 1), mode(1, 2)];
        let batch = take_batch(&window, |_, _| false).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn stops_at_first_incompatible() {
        let window = [mode(0, 1), mode(1, 1), mode(2, 2), mode(3, 1)];
        let batch = take_batch(&window, same_value).unwrap();
        assert_eq!(batch, &window[..2]);
    }

    #[test]
    fn whole_window_when_all_compatible() {
        let window = [mode(0, 1), mode(1, 1), mode(2, 1)];
        assert_eq!(take_batch(&window, same_value).unwrap().len(), 3);
    }

    #[test]
    fn timestamp_regression_ends_batch() {
        let window = [mode(10, 1), mode(5, 1), mode(20, 1)];
        let batch = take_batch(&window, same_value).unwrap();
        assert_eq!(batch.len(), 1);
    }
}
