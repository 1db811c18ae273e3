//! Alarm lifecycle through the scheduler: snapshots open, extend and clear
//! alarm occurrences in SQLite.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};

use cncflow_core::cancel::CancelToken;
use cncflow_core::clock::ManualClock;
use cncflow_core::config::Config;
use cncflow_core::model::AlarmInterval;
use cncflow_core::queue::MemoryQueue;
use cncflow_core::record::{Command, DataRecord, ModuleId};
use cncflow_core::scheduler::Scheduler;
use cncflow_core::storage::{SqliteStore, Store};

const M: ModuleId = ModuleId(12);

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn snapshot(secs: i64, alarms: Value) -> DataRecord {
    DataRecord::new(Command::Alarms, M, "", alarms, at(secs))
}

fn alarm(number: &str, message: &str) -> Value {
    json!({"cnc_info": "path1", "type": "PS", "number": number, "message": message})
}

fn drain(store: &Arc<SqliteStore>, records: Vec<DataRecord>) {
    let mut config = Config::default();
    config.scheduler.sleep_ms = 1;
    let queue = MemoryQueue::with_records(records);
    let mut scheduler = Scheduler::with_clock(
        M,
        queue.clone(),
        Arc::clone(store),
        ManualClock::new(at(86_400)),
        &config,
        CancelToken::new(),
    );
    scheduler.drain().unwrap();
    assert!(queue.is_empty());
}

fn alarms(store: &SqliteStore) -> Vec<AlarmInterval> {
    store.read("r", |tx| tx.alarms(M)).unwrap()
}

#[test]
fn empty_snapshot_clears_every_open_alarm() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("alarms.db")).unwrap());
    drain(
        &store,
        vec![
            snapshot(0, json!([alarm("100", "spindle overload"), alarm("200", "door open")])),
            snapshot(10, json!([alarm("100", "spindle overload"), alarm("200", "door open")])),
            snapshot(20, json!([])),
        ],
    );

    let stored = alarms(&store);
    assert_eq!(stored.len(), 2);
    for alarm in &stored {
        assert!(!alarm.open);
        assert_eq!((alarm.begin, alarm.end), (at(0), at(10)));
    }
    let open = store.read("r", |tx| tx.open_alarms(M)).unwrap();
    assert!(open.is_empty());
}

#[test]
fn partial_snapshot_clears_only_missing_alarms() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("alarms.db")).unwrap());
    drain(
        &store,
        vec![
            snapshot(0, json!([alarm("100", "spindle overload"), alarm("200", "door open")])),
            snapshot(15, json!([alarm("200", "door open")])),
        ],
    );

    let stored = alarms(&store);
    let by_number = |n: &str| {
        stored
            .iter()
            .find(|a| a.key.number == n)
            .cloned()
            .unwrap()
    };
    assert!(!by_number("100").open);
    let door = by_number("200");
    assert!(door.open);
    assert_eq!((door.begin, door.end), (at(0), at(15)));
}

#[test]
fn reappearing_alarm_after_restart_opens_new_occurrence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alarms.db");
    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        drain(
            &store,
            vec![
                snapshot(0, json!([alarm("300", "coolant low")])),
                snapshot(30, json!([])),
            ],
        );
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    drain(&store, vec![snapshot(40, json!([alarm("300", "coolant low")]))]);

    let stored = alarms(&store);
    assert_eq!(stored.len(), 2);
    assert!(!stored[0].open);
    assert_eq!(stored[1].begin, at(40));
    assert!(stored[1].open);
}

#[test]
fn redelivered_snapshots_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("alarms.db")).unwrap());
    let records = vec![
        snapshot(0, json!([alarm("100", "spindle overload")])),
        snapshot(20, json!([alarm("100", "spindle overload")])),
    ];
    drain(&store, records.clone());
    let before = alarms(&store);
    drain(&store, records);
    assert_eq!(alarms(&store), before);
}
