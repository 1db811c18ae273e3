//! `cncflow replay`: drain a JSONL capture through the import pipeline.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use cncflow_core::config::Config;
use cncflow_core::queue::MemoryQueue;
use cncflow_core::record::{DataRecord, ModuleId};
use cncflow_core::scheduler::SchedulerStats;
use cncflow_core::service::{ImportService, RunMode};
use cncflow_core::storage::SqliteStore;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct ModuleSummary {
    pub module: ModuleId,
    /// Records left in the queue (failed batches stay queued).
    pub remaining: usize,
    #[serde(flatten)]
    pub stats: SchedulerStats,
}

#[derive(Debug, Serialize)]
pub struct ReplaySummary {
    pub records: usize,
    pub modules: Vec<ModuleSummary>,
}

/// Read records grouped by module, preserving file order within a module.
fn read_records(path: &Path) -> Result<BTreeMap<ModuleId, Vec<DataRecord>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut grouped: BTreeMap<ModuleId, Vec<DataRecord>> = BTreeMap::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: DataRecord = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid record", path.display(), index + 1))?;
        grouped.entry(record.module_id).or_default().push(record);
    }
    Ok(grouped)
}

pub async fn replay(
    config: &Config,
    db: &Path,
    records: &Path,
    stamps: &[i64],
) -> Result<ReplaySummary> {
    let grouped = read_records(records)?;
    let total = grouped.values().map(Vec::len).sum();
    let store = Arc::new(
        SqliteStore::open(db).with_context(|| format!("opening database {}", db.display()))?,
    );
    for stamp in stamps {
        store.add_stamp(*stamp)?;
    }
    info!(records = total, modules = grouped.len(), db = %db.display(), "Replaying capture");

    let queues: BTreeMap<ModuleId, MemoryQueue> = grouped
        .into_iter()
        .map(|(module, module_records)| (module, MemoryQueue::with_records(module_records)))
        .collect();
    let service = ImportService::new(store, config.clone());
    let handle = service.spawn_with(
        RunMode::Drain,
        queues.iter().map(|(module, queue)| (*module, queue.clone())),
    );
    let finished = handle.join().await.context("replaying capture")?;

    let modules = finished
        .into_iter()
        .map(|(module, stats)| ModuleSummary {
            module,
            remaining: queues.get(&module).map_or(0, MemoryQueue::len),
            stats,
        })
        .collect();
    Ok(ReplaySummary {
        records: total,
        modules,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_records_groups_by_module_and_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"command":"machine_mode","module_id":2,"value":1,"timestamp":"2024-01-01T00:00:00Z"}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"command":"stamp","module_id":1,"value":7,"timestamp":"2024-01-01T00:00:05Z"}}"#
        )
        .unwrap();

        let grouped = read_records(file.path()).unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&ModuleId(1)].len(), 1);
        assert_eq!(grouped[&ModuleId(2)].len(), 1);
    }

    #[test]
    fn invalid_line_reports_position() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();
        let err = read_records(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains(":1: invalid record"));
    }
}
