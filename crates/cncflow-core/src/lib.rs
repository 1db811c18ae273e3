//! cncflow-core: per-module CNC data import and consolidation engine
//!
//! Shop-floor collectors append timestamped records (machine-mode changes,
//! alarm sets, variable snapshots, activity signals, stamps, milestones) to a
//! durable queue per machine module. This crate drains those queues and
//! consolidates the records into time-ranged storage entities.
//!
//! # Architecture
//!
//! ```text
//! Queue ─peek─▶ Scheduler ─▶ Batcher ─▶ StrategyRegistry ─▶ Store (one tx per batch)
//!   ▲               │                         │
//!   └──dequeue──────┘◀──── RetryController ◀──┘
//! ```
//!
//! # Modules
//!
//! - `record`: input records and command tags
//! - `model`: consolidated entities (intervals, alarms, variables, detections)
//! - `queue`: queue contract plus in-memory and multi-queue implementations
//! - `storage`: transactional store contract, memory and SQLite backends
//! - `batch`: maximal compatible batch selection
//! - `strategy`: one consolidation strategy per command
//! - `registry`: closed command → strategy dispatch
//! - `cache`: last-known-state caches with reload recovery
//! - `fault` / `retry`: fault classification and bounded retry
//! - `scheduler`: the per-module import loop
//! - `service`: tokio runner, one scheduler per module
//! - `config` / `logging`: TOML configuration and tracing setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod batch;
pub mod cache;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod fault;
pub mod import_log;
pub mod logging;
pub mod model;
pub mod queue;
pub mod record;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod strategy;

pub use error::{Error, Result, StorageError};

/// Version of the cncflow-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
