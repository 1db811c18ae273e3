//! Backend parity: the same batches consolidated into the in-memory store and
//! into SQLite must leave identical entities behind.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde_json::{Value, json};

use cncflow_core::cancel::CancelToken;
use cncflow_core::config::StrategiesConfig;
use cncflow_core::model::{
    AcquisitionMarker, AlarmInterval, Detection, ImportLogEntry, IntervalKind, StateInterval, VariableRecord,
};
use cncflow_core::record::{Command, DataRecord, ModuleId};
use cncflow_core::registry::StrategyRegistry;
use cncflow_core::storage::{Isolation, MemoryStore, SqliteStore, Store};

const M: ModuleId = ModuleId(3);

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn rec(command: Command, secs: i64, value: Value) -> DataRecord {
    DataRecord::new(command, M, "", value, at(secs))
}

fn alarm(number: &str, message: &str) -> Value {
    json!({"cnc_info": "path1", "type": "OT", "number": number, "message": message})
}

/// Batches covering every strategy, including anomalies and back-correction.
fn script() -> Vec<Vec<DataRecord>> {
    vec![
        vec![
            rec(Command::MachineMode, 0, json!(2)),
            rec(Command::MachineMode, 20, json!(2)),
        ],
        vec![rec(Command::MachineMode, 10, json!(1))],
        vec![rec(Command::MachineMode, 50, json!(1))],
        vec![rec(Command::MachineMode, 500, json!(2)), rec(Command::MachineMode, 510, json!(2))],
        vec![rec(Command::ModuleActivity, 0, json!(4)), rec(Command::ModuleActivity, 5, json!(4))],
        vec![rec(Command::ModuleActivity, 300, json!(4)), rec(Command::ModuleActivity, 305, json!(4))],
        vec![
            rec(Command::Alarms, 0, json!([alarm("1", "overtravel"), alarm("2", "limit")])),
            rec(Command::Alarms, 10, json!([alarm("2", "limit"), alarm("1", "overtravel")])),
        ],
        vec![rec(Command::Alarms, 20, json!([alarm("1", "overtravel x")]))],
        vec![rec(Command::Alarms, 30, json!([]))],
        vec![rec(Command::Variables, 10, json!({"feed": 100, "speed": 800}))],
        vec![rec(Command::Variables, 20, json!({"feed": 90, "speed": null}))],
        vec![rec(Command::Variables, 15, json!({"feed": 70}))],
        vec![rec(Command::Stamp, 40, json!(8)), rec(Command::Stamp, 41, json!(8))],
        vec![rec(Command::Stamp, 42, json!(99))],
        vec![rec(Command::Milestone, 60, json!({"sequence": 1, "milestone_secs": 30.5}))],
        vec![rec(Command::Variables, 600, json!("not an object"))],
    ]
}

fn consolidate<S: Store>(store: &S) {
    let mut registry = StrategyRegistry::from_config(M, &StrategiesConfig::default());
    let cancel = CancelToken::new();
    for batch in script() {
        registry
            .apply(batch[0].command, &batch, store, &cancel)
            .unwrap();
    }
}

#[derive(Debug, PartialEq)]
struct Dump {
    machine_mode: Vec<StateInterval>,
    activity: Vec<StateInterval>,
    alarms: Vec<AlarmInterval>,
    variables: Vec<(String, Vec<VariableRecord>)>,
    detections: Vec<Detection>,
    import_log: Vec<ImportLogEntry>,
}

fn dump<S: Store>(store: &S) -> Dump {
    store
        .read("dump", |tx| {
            let mut variables = Vec::new();
            for key in tx.variable_keys(M)? {
                let history = tx.variables(M, &key)?;
                variables.push((key, history));
            }
            Ok(Dump {
                machine_mode: tx.intervals(IntervalKind::MachineMode, M)?,
                activity: tx.intervals(IntervalKind::ModuleActivity, M)?,
                alarms: tx.alarms(M)?,
                variables,
                detections: tx.detections(M)?,
                import_log: tx.import_log(M)?,
            })
        })
        .unwrap()
}

#[test]
fn memory_and_sqlite_consolidate_identically() {
    let memory = MemoryStore::new();
    memory.add_stamp(8);
    consolidate(&memory);

    let sqlite = SqliteStore::open_in_memory().unwrap();
    sqlite.add_stamp(8).unwrap();
    consolidate(&sqlite);

    let expected = dump(&memory);
    assert_eq!(dump(&sqlite), expected);

    // Sanity: the script exercised every anomaly path.
    assert!(expected.import_log.len() >= 3);
    assert_eq!(expected.detections.len(), 2);
    assert_eq!(expected.variables.len(), 2);
}

#[test]
fn sqlite_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parity.db");
    {
        let sqlite = SqliteStore::open(&path).unwrap();
        sqlite.add_stamp(8).unwrap();
        consolidate(&sqlite);
    }
    let reopened = SqliteStore::open(&path).unwrap();

    let memory = MemoryStore::new();
    memory.add_stamp(8);
    consolidate(&memory);
    assert_eq!(dump(&reopened), dump(&memory));
}

#[test]
fn acquisition_markers_and_detection_cleanup_match() {
    fn exercise<S: Store>(store: &S) -> (Option<AcquisitionMarker>, usize, usize) {
        store
            .transaction("markers", Isolation::Serializable, |tx| {
                let early = AcquisitionMarker::of(&rec(Command::Stamp, 5, json!(1)));
                let late = AcquisitionMarker::of(&rec(Command::Stamp, 9, json!(2)));
                tx.set_acquisition_marker(M, Command::Stamp, &early)?;
                tx.set_acquisition_marker(M, Command::Stamp, &late)?;
                for secs in [0, 100, 200] {
                    tx.insert_detection(&Detection {
                        module: M,
                        at: at(secs),
                        kind: cncflow_core::model::DetectionKind::Stamp { stamp_id: 1 },
                    })?;
                }
                Ok(())
            })
            .unwrap();
        store
            .transaction("cleanup", Isolation::ReadCommitted, |tx| {
                let marker = tx.acquisition_marker(M, Command::Stamp)?;
                let removed = tx.delete_detections_before(at(150))?;
                let left = tx.detections(M)?.len();
                Ok((marker, removed, left))
            })
            .unwrap()
    }

    let memory = exercise(&MemoryStore::new());
    let sqlite = exercise(&SqliteStore::open_in_memory().unwrap());
    let expected = AcquisitionMarker {
        at: at(9),
        content: "2".to_string(),
    };
    assert_eq!(memory, (Some(expected), 2, 1));
    assert_eq!(sqlite, memory);
}

#[test]
fn rolled_back_transaction_leaves_sqlite_untouched() {
    let sqlite = SqliteStore::open_in_memory().unwrap();
    let interval = StateInterval::new(at(0), at(0) + TimeDelta::seconds(5), 1);
    let result: cncflow_core::Result<()> =
        sqlite.transaction("aborted", Isolation::Serializable, |tx| {
            tx.upsert_interval(IntervalKind::MachineMode, M, &interval)?;
            Err(cncflow_core::Error::Invariant("abort".into()))
        });
    assert!(result.is_err());
    let rows = sqlite
        .read("r", |tx| tx.intervals(IntervalKind::MachineMode, M))
        .unwrap();
    assert!(rows.is_empty());
}

#[test]
fn sub_millisecond_changes_collapse_identically() {
    fn exercise<S: Store>(store: &S) -> Vec<VariableRecord> {
        let base = at(100);
        let first = DataRecord::new(
            Command::Variables,
            M,
            "",
            json!({"feed": 1}),
            base + TimeDelta::microseconds(400),
        );
        let second = DataRecord::new(
            Command::Variables,
            M,
            "",
            json!({"feed": 2}),
            base + TimeDelta::microseconds(700),
        );
        let mut registry = StrategyRegistry::from_config(M, &StrategiesConfig::default());
        let cancel = CancelToken::new();
        for record in [first, second] {
            registry
                .apply(Command::Variables, std::slice::from_ref(&record), store, &cancel)
                .unwrap();
        }
        store.read("r", |tx| tx.variables(M, "feed")).unwrap()
    }

    let memory = exercise(&MemoryStore::new());
    let sqlite = exercise(&SqliteStore::open_in_memory().unwrap());
    assert_eq!(memory.len(), 1);
    assert_eq!(memory[0].payload, json!(2));
    assert_eq!(memory[0].begin, at(100));
    assert_eq!(sqlite, memory);
}
