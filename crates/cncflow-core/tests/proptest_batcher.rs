//! Property-based tests for batch selection.
//!
//! The batch is the maximal prefix of the window in which every record is
//! compatible with its predecessor, and it is never empty for a non-empty
//! window.

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use cncflow_core::batch::take_batch;
use cncflow_core::config::StrategiesConfig;
use cncflow_core::record::{Command, DataRecord, ModuleId};
use cncflow_core::registry::StrategyRegistry;
use cncflow_core::storage::MemoryStore;

// =============================================================================
// Strategies
// =============================================================================

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn arb_command() -> impl Strategy<Value = Command> {
    prop_oneof![
        4 => Just(Command::MachineMode),
        2 => Just(Command::ModuleActivity),
        1 => Just(Command::Stamp),
        1 => Just(Command::Milestone),
    ]
}

/// Windows of records with mostly increasing timestamps and a few regressions.
fn arb_window() -> impl Strategy<Value = Vec<DataRecord>> {
    prop::collection::vec((arb_command(), 0i64..3, -5i64..90), 1..40).prop_map(|steps| {
        let mut secs = 0;
        steps
            .into_iter()
            .map(|(command, state, delta)| {
                secs += delta;
                let value = match command {
                    Command::Milestone => json!({"sequence": state, "milestone_secs": 1.0}),
                    _ => json!(state),
                };
                DataRecord::new(command, ModuleId(1), "", value, at(secs))
            })
            .collect()
    })
}

fn registry() -> StrategyRegistry {
    StrategyRegistry::from_config(ModuleId(1), &StrategiesConfig::default())
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn batch_is_non_empty_prefix(window in arb_window()) {
        let registry = registry();
        let batch = take_batch(&window, |a, b| registry.is_compatible::<MemoryStore>(a, b)).unwrap();
        prop_assert!(!batch.is_empty());
        prop_assert_eq!(batch, &window[..batch.len()]);
    }

    #[test]
    fn every_pair_in_batch_is_compatible(window in arb_window()) {
        let registry = registry();
        let batch = take_batch(&window, |a, b| registry.is_compatible::<MemoryStore>(a, b)).unwrap();
        for pair in batch.windows(2) {
            prop_assert!(registry.is_compatible::<MemoryStore>(&pair[0], &pair[1]));
            prop_assert!(pair[1].timestamp >= pair[0].timestamp);
        }
    }

    #[test]
    fn batch_cannot_be_extended(window in arb_window()) {
        let registry = registry();
        let batch = take_batch(&window, |a, b| registry.is_compatible::<MemoryStore>(a, b)).unwrap();
        if let Some(next) = window.get(batch.len()) {
            let tail = &batch[batch.len() - 1];
            let regression = next.same_stream(tail) && next.timestamp < tail.timestamp;
            prop_assert!(regression || !registry.is_compatible::<MemoryStore>(tail, next));
        }
    }

    #[test]
    fn batch_is_single_command(window in arb_window()) {
        let registry = registry();
        let batch = take_batch(&window, |a, b| registry.is_compatible::<MemoryStore>(a, b)).unwrap();
        prop_assert!(batch.iter().all(|r| r.command == batch[0].command));
    }
}

#[test]
fn empty_window_gives_empty_batch() {
    let registry = registry();
    let batch = take_batch(&[], |a, b| registry.is_compatible::<MemoryStore>(a, b)).unwrap();
    assert!(batch.is_empty());
}
