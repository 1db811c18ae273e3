//! Operator-visible anomaly reporting.
//!
//! Anomalies (clock regressions, unknown stamps, undecodable payloads) are
//! written to the store's import log and mirrored as tracing events, so they
//! show up both in the operator UI and in the process logs.

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::error::Result;
use crate::model::{ImportLogEntry, ImportLogLevel};
use crate::record::{Command, ModuleId};
use crate::storage::{Isolation, Store, StoreTx};

/// Record an anomaly inside the current transaction.
pub fn report(
    tx: &mut dyn StoreTx,
    module: ModuleId,
    command: Command,
    at: DateTime<Utc>,
    level: ImportLogLevel,
    message: impl Into<String>,
) -> Result<()> {
    let message = message.into();
    match level {
        ImportLogLevel::Warning => {
            warn!(module_id = %module, %command, %at, "{message}");
        }
        ImportLogLevel::Error => {
            error!(module_id = %module, %command, %at, "{message}");
        }
    }
    tx.log_import(&ImportLogEntry {
        module,
        at,
        level,
        message,
    })
}

/// Record an anomaly in a transaction of its own.
pub fn report_detached<S: Store>(
    store: &S,
    module: ModuleId,
    command: Command,
    at: DateTime<Utc>,
    level: ImportLogLevel,
    message: impl Into<String>,
) -> Result<()> {
    let message = message.into();
    store.transaction("import_log", Isolation::ReadCommitted, |tx| {
        report(tx, module, command, at, level, message)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;

    #[test]
    fn detached_report_commits_entry() {
        let store = MemoryStore::new();
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        report_detached(
            &store,
            ModuleId(2),
            Command::Stamp,
            at,
            ImportLogLevel::Error,
            "unknown stamp 4",
        )
        .unwrap();
        let log = store.read("r", |tx| tx.import_log(ModuleId(2))).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].level, ImportLogLevel::Error);
        assert_eq!(log[0].message, "unknown stamp 4");
    }
}
