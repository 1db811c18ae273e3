//! Per-module import loop.
//!
//! A [`Scheduler`] owns one module's queue handle and strategy registry. Each
//! iteration runs due maintenance, peeks a window, decides whether to
//! process or defer, cuts the maximal compatible batch, applies it through
//! the retry controller and only then removes it from the queue.
//!
//! # Loop states
//!
//! ```text
//! Uninitialized -> Initializing -> Draining <-> Idle
//!                        |            |          |
//!                        +------------+----------+--> Stopped (cancelled / fatal)
//! ```

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::batch::take_batch;
use crate::cancel::CancelToken;
use crate::clock::{Clock, PeriodicTimer, SystemClock};
use crate::config::{Config, SchedulerConfig};
use crate::error::{Error, Result};
use crate::fault::{FaultClass, classify};
use crate::queue::Queue;
use crate::record::{Command, DataRecord, ModuleId};
use crate::registry::StrategyRegistry;
use crate::retry::RetryController;
use crate::storage::{Isolation, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Uninitialized,
    Initializing,
    Draining,
    Idle,
    Stopped,
}

/// What the caller should do after one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Run the next iteration right away.
    Continue,
    /// Nothing to do (or a recoverable failure); sleep before the next iteration.
    Sleep(Duration),
    /// Cancellation was requested.
    Stop,
}

/// Counters kept by one scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub iterations: u64,
    pub batches_applied: u64,
    pub records_dequeued: u64,
    pub replayed_batches: u64,
    pub discarded_batches: u64,
    pub anomalies: u64,
    /// Fast-path dequeues that fell back to per-item verification.
    pub dequeue_fallbacks: u64,
    /// Per-item verification stopped on a record that differed from the batch.
    pub discrepancies: u64,
    pub failed_batches: u64,
    /// Iterations re-run after a stale read or serialization failure.
    pub iteration_retries: u64,
    /// In-place retries performed by the retry controller.
    pub retries: u64,
    pub deferrals: u64,
    pub foreign_records: u64,
    pub init_failures: u64,
    pub vacuums: u64,
    pub detections_cleaned: u64,
    pub priority_switches: u64,
}

pub struct Scheduler<Q, S, C = SystemClock> {
    module: ModuleId,
    queue: Q,
    store: S,
    clock: C,
    registry: StrategyRegistry,
    retry: RetryController,
    config: SchedulerConfig,
    cancel: CancelToken,
    state: SchedulerState,
    stats: SchedulerStats,
    vacuum_timer: PeriodicTimer,
    cleanup_timer: PeriodicTimer,
    /// Clock time of the last batch applied per command.
    last_visited: HashMap<Command, DateTime<Utc>>,
    /// Virtual queues visited in a row without eligible work.
    idle_visits: usize,
    /// Process short windows immediately (drain mode).
    force: bool,
}

impl<Q, S, C> std::fmt::Debug for Scheduler<Q, S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("module", &self.module)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<Q: Queue, S: Store> Scheduler<Q, S> {
    pub fn new(module: ModuleId, queue: Q, store: S, config: &Config, cancel: CancelToken) -> Self {
        Self::with_clock(module, queue, store, SystemClock, config, cancel)
    }
}

impl<Q: Queue, S: Store, C: Clock> Scheduler<Q, S, C> {
    pub fn with_clock(
        module: ModuleId,
        queue: Q,
        store: S,
        clock: C,
        config: &Config,
        cancel: CancelToken,
    ) -> Self {
        let now = clock.now();
        let scheduler = config.scheduler.clone();
        Self {
            module,
            queue,
            store,
            registry: StrategyRegistry::from_config(module, &config.strategies),
            retry: RetryController::new(config.retry.policy()),
            vacuum_timer: PeriodicTimer::new(scheduler.vacuum_interval(), now),
            cleanup_timer: PeriodicTimer::new(scheduler.cleanup_interval(), now),
            last_visited: HashMap::from([(Command::MachineMode, now)]),
            clock,
            config: scheduler,
            cancel,
            state: SchedulerState::Uninitialized,
            stats: SchedulerStats::default(),
            idle_visits: 0,
            force: false,
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn last_visited(&self, command: Command) -> Option<DateTime<Utc>> {
        self.last_visited.get(&command).copied()
    }

    /// Run until cancelled or a fatal fault occurs.
    pub fn run(&mut self) -> Result<SchedulerStats> {
        info!(module_id = %self.module, "Scheduler started");
        loop {
            match self.run_once()? {
                Step::Continue => {}
                Step::Sleep(duration) => {
                    if !self.cancel.sleep(duration) {
                        self.state = SchedulerState::Stopped;
                        break;
                    }
                }
                Step::Stop => break,
            }
        }
        info!(
            module_id = %self.module,
            batches = self.stats.batches_applied,
            records = self.stats.records_dequeued,
            "Scheduler stopped"
        );
        Ok(self.stats.clone())
    }

    /// Process everything currently queued, ignoring the minimum batch
    /// size, and return once the loop would go idle.
    pub fn drain(&mut self) -> Result<SchedulerStats> {
        self.force = true;
        let result = loop {
            match self.run_once() {
                Ok(Step::Continue) => {}
                Ok(Step::Sleep(_) | Step::Stop) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.force = false;
        result.map(|()| self.stats.clone())
    }

    /// One loop iteration. Only fatal faults are returned as errors.
    pub fn run_once(&mut self) -> Result<Step> {
        if self.cancel.is_cancelled() {
            self.state = SchedulerState::Stopped;
            return Ok(Step::Stop);
        }
        self.stats.iterations += 1;

        if !self.queue.is_initialized() {
            self.state = SchedulerState::Initializing;
            if let Err(e) = self.queue.initialize() {
                if classify(&e).is_fatal() {
                    self.state = SchedulerState::Stopped;
                    return Err(e);
                }
                self.stats.init_failures += 1;
                warn!(
                    module_id = %self.module,
                    error = %e,
                    retry_ms = self.config.init_retry_ms,
                    "Queue initialization failed"
                );
                return Ok(Step::Sleep(self.config.init_retry()));
            }
            info!(module_id = %self.module, queues = self.queue.queue_count(), "Queue initialized");
        }

        match self.iterate() {
            Ok(step) => Ok(step),
            Err(e) => self.on_failure(e),
        }
    }

    fn iterate(&mut self) -> Result<Step> {
        let now = self.clock.now();
        self.maintenance(now);

        let window = self.queue.peek(self.config.fetch_size)?;
        if !self.has_work(&window, now) {
            return Ok(self.rotate());
        }
        self.idle_visits = 0;
        self.state = SchedulerState::Draining;

        let head = &window[0];
        if head.module_id != self.module {
            warn!(
                module_id = %self.module,
                record_module = %head.module_id,
                command = %head.command,
                "Dropping record addressed to another module"
            );
            self.stats.foreign_records += 1;
            self.dequeue_batch(&window[..1])?;
            return Ok(Step::Continue);
        }

        let command = head.command;
        let batch = take_batch(&window, |tail, candidate| {
            self.registry.is_compatible::<S>(tail, candidate)
        })?;
        self.apply(command, batch, now)?;
        self.dequeue_batch(batch)?;
        Ok(Step::Continue)
    }

    fn has_work(&mut self, window: &[DataRecord], now: DateTime<Utc>) -> bool {
        let Some(oldest) = window.first() else {
            return false;
        };
        if self.force
            || window.len() >= self.config.min_batch_size
            || now - oldest.timestamp >= self.config.process_anyway_age()
        {
            return true;
        }
        self.stats.deferrals += 1;
        debug!(
            module_id = %self.module,
            queue = self.queue.current_index(),
            pending = window.len(),
            min_batch = self.config.min_batch_size,
            "Deferring short window"
        );
        false
    }

    /// Move to the next virtual queue; sleep once every queue was visited without work.
    fn rotate(&mut self) -> Step {
        let count = self.queue.queue_count();
        if count > 1 {
            self.queue.move_next();
        }
        self.idle_visits += 1;
        if self.idle_visits < count {
            return Step::Continue;
        }
        self.idle_visits = 0;
        self.state = SchedulerState::Idle;
        Step::Sleep(self.config.sleep())
    }

    fn apply(&mut self, command: Command, batch: &[DataRecord], now: DateTime<Utc>) -> Result<()> {
        let registry = &mut self.registry;
        let store = &self.store;
        let cancel = &self.cancel;
        let module = self.module;
        let outcome = self.retry.run(cancel, |attempt| {
            if attempt > 1 {
                debug!(module_id = %module, %command, attempt, "Retrying batch");
            }
            registry.apply(command, batch, store, cancel)
        });
        self.stats.retries += u64::from(outcome.attempts.saturating_sub(1));
        let report = outcome.result?;

        self.last_visited.insert(command, now);
        self.stats.batches_applied += 1;
        self.stats.anomalies += report.anomalies as u64;
        if report.replayed {
            self.stats.replayed_batches += 1;
        }
        if report.discarded {
            self.stats.discarded_batches += 1;
        }
        debug!(
            module_id = %module,
            %command,
            batch_len = batch.len(),
            writes = report.writes,
            replayed = report.replayed,
            discarded = report.discarded,
            attempts = outcome.attempts,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Batch consolidated"
        );
        Ok(())
    }

    /// Remove `batch` from the queue, verifying each record when the fast path refuses.
    fn dequeue_batch(&mut self, batch: &[DataRecord]) -> Result<()> {
        let Some(last) = batch.last() else {
            return Ok(());
        };
        if self.queue.unsafe_dequeue(batch.len(), last)? {
            self.stats.records_dequeued += batch.len() as u64;
            return Ok(());
        }

        self.stats.dequeue_fallbacks += 1;
        warn!(
            module_id = %self.module,
            batch_len = batch.len(),
            "Queue changed since peek; dequeuing record by record"
        );
        for (position, expected) in batch.iter().enumerate() {
            let head = self.queue.peek(1)?;
            match head.first() {
                Some(actual) if actual == expected => {
                    self.queue.dequeue()?;
                    self.stats.records_dequeued += 1;
                }
                actual => {
                    self.stats.discrepancies += 1;
                    warn!(
                        module_id = %self.module,
                        position,
                        expected_command = %expected.command,
                        expected_timestamp = %expected.timestamp,
                        actual_timestamp = ?actual.map(|r| r.timestamp),
                        "Queue head does not match the consolidated batch; stopping dequeue"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    fn maintenance(&mut self, now: DateTime<Utc>) {
        if self.vacuum_timer.fire_if_due(now) {
            match self.queue.vacuum_if_needed() {
                Ok(true) => {
                    self.stats.vacuums += 1;
                    debug!(module_id = %self.module, "Queue vacuumed");
                }
                Ok(false) => {}
                Err(e) => warn!(module_id = %self.module, error = %e, "Queue vacuum failed"),
            }
        }

        if self.cleanup_timer.fire_if_due(now) {
            self.cleanup_detections(now);
        }

        if self.queue.queue_count() > 1 && self.queue.current_index() != 0 {
            let last = self
                .last_visited
                .get(&Command::MachineMode)
                .copied()
                .unwrap_or(now);
            if now - last >= self.config.machine_mode_visit_interval() {
                self.queue.reset();
                // The switch counts as a visit even when the queue turns out empty.
                self.last_visited.insert(Command::MachineMode, now);
                self.idle_visits = 0;
                self.stats.priority_switches += 1;
                debug!(module_id = %self.module, "Switching back to the machine-mode queue");
            }
        }
    }

    fn cleanup_detections(&mut self, now: DateTime<Utc>) {
        let Some(cutoff) = now.checked_sub_signed(self.config.detection_retention()) else {
            return;
        };
        let removed = self
            .store
            .transaction("detection_cleanup", Isolation::ReadCommitted, |tx| {
                tx.delete_detections_before(cutoff)
            });
        match removed {
            Ok(0) => {}
            Ok(count) => {
                self.stats.detections_cleaned += count as u64;
                info!(module_id = %self.module, count, %cutoff, "Removed stale detections");
            }
            Err(e) => warn!(module_id = %self.module, error = %e, "Detection cleanup failed"),
        }
    }

    fn on_failure(&mut self, e: Error) -> Result<Step> {
        let class = classify(&e);
        match class {
            FaultClass::Cancelled => {
                self.state = SchedulerState::Stopped;
                Ok(Step::Stop)
            }
            FaultClass::StaleRead | FaultClass::SerializationFailure => {
                self.stats.iteration_retries += 1;
                debug!(module_id = %self.module, fault = %class, error = %e, "Retrying iteration");
                Ok(Step::Continue)
            }
            FaultClass::Fatal => {
                error!(module_id = %self.module, fault = %class, error = %e, "Fatal fault; stopping scheduler");
                self.state = SchedulerState::Stopped;
                Err(e)
            }
            FaultClass::Transient | FaultClass::TransientWithDelay | FaultClass::Other => {
                self.stats.failed_batches += 1;
                error!(module_id = %self.module, fault = %class, error = %e, "Batch failed; will retry later");
                Ok(Step::Sleep(self.config.sleep()))
            }
        }
    }
}
