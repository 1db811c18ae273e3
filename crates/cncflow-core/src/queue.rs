//! Durable event queue contract and in-memory reference implementations.
//!
//! A scheduler owns exactly one [`Queue`]. The physical queue is an external
//! collaborator; [`MemoryQueue`] and [`MultiQueue`] exist for replay and
//! tests, and document the behaviour the scheduler relies on:
//!
//! - `peek` is non-destructive and returns records in delivery order
//! - `unsafe_dequeue` is the fast bulk path; it refuses to remove anything
//!   when the item at position `count - 1` is not the expected one
//! - `dequeue` removes exactly one record

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{QueueError, Result};
use crate::record::DataRecord;

/// Consumer side of a module's durable queue.
pub trait Queue: Send {
    /// Open the queue handle. May fail transiently; the scheduler retries.
    fn initialize(&mut self) -> Result<()>;

    fn is_initialized(&self) -> bool;

    /// Up to `max` records from the head, without removing them.
    fn peek(&mut self, max: usize) -> Result<Vec<DataRecord>>;

    /// Remove `count` records if the last of them equals `expected_last`.
    ///
    /// Returns `false` (removing nothing) when the queue disagrees.
    fn unsafe_dequeue(&mut self, count: usize, expected_last: &DataRecord) -> Result<bool>;

    /// Remove and return the head record.
    fn dequeue(&mut self) -> Result<Option<DataRecord>>;

    /// Compact the backing store when enough records were consumed.
    fn vacuum_if_needed(&mut self) -> Result<bool>;

    /// Number of virtual queues behind this handle.
    fn queue_count(&self) -> usize {
        1
    }

    /// Index of the virtual queue `peek` currently reads from.
    fn current_index(&self) -> usize {
        0
    }

    /// Rotate to the next virtual queue; returns the new index.
    fn move_next(&mut self) -> usize {
        0
    }

    /// Go back to the first (highest priority) virtual queue.
    fn reset(&mut self) {}
}

/// Records consumed between two compactions of a [`MemoryQueue`].
pub const DEFAULT_VACUUM_THRESHOLD: usize = 1024;

#[derive(Debug, Default)]
struct MemoryQueueInner {
    records: VecDeque<DataRecord>,
    consumed_since_vacuum: usize,
    failing_initializations: u32,
}

/// In-memory queue. Clones share the same backing deque, so a test can
/// mutate the queue "externally" between a peek and a dequeue.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    inner: Arc<Mutex<MemoryQueueInner>>,
    initialized: bool,
    vacuum_threshold: usize,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryQueueInner::default())),
            initialized: false,
            vacuum_threshold: DEFAULT_VACUUM_THRESHOLD,
        }
    }

    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = DataRecord>) -> Self {
        let queue = Self::new();
        queue.extend(records);
        queue
    }

    #[must_use]
    pub fn with_vacuum_threshold(mut self, threshold: usize) -> Self {
        self.vacuum_threshold = threshold.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryQueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer side: append one record.
    pub fn push(&self, record: DataRecord) {
        self.lock().records.push_back(record);
    }

    pub fn extend(&self, records: impl IntoIterator<Item = DataRecord>) {
        self.lock().records.extend(records);
    }

    /// Remove the head record as an external actor would.
    pub fn steal_front(&self) -> Option<DataRecord> {
        self.lock().records.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<DataRecord> {
        self.lock().records.iter().cloned().collect()
    }

    /// Make the next `count` calls to `initialize` fail.
    pub fn fail_next_initializations(&self, count: u32) {
        self.lock().failing_initializations = count;
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(QueueError::NotInitialized.into())
        }
    }
}

impl Queue for MemoryQueue {
    fn initialize(&mut self) -> Result<()> {
        let mut inner = self.lock();
        if inner.failing_initializations > 0 {
            inner.failing_initializations -= 1;
            return Err(QueueError::Unavailable("queue backend not ready".to_string()).into());
        }
        drop(inner);
        self.initialized = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn peek(&mut self, max: usize) -> Result<Vec<DataRecord>> {
        self.ensure_initialized()?;
        Ok(self.lock().records.iter().take(max).cloned().collect())
    }

    fn unsafe_dequeue(&mut self, count: usize, expected_last: &DataRecord) -> Result<bool> {
        self.ensure_initialized()?;
        if count == 0 {
            return Ok(true);
        }
        let mut inner = self.lock();
        if inner.records.get(count - 1) != Some(expected_last) {
            return Ok(false);
        }
        inner.records.drain(..count);
        inner.consumed_since_vacuum += count;
        Ok(true)
    }

    fn dequeue(&mut self) -> Result<Option<DataRecord>> {
        self.ensure_initialized()?;
        let mut inner = self.lock();
        let record = inner.records.pop_front();
        if record.is_some() {
            inner.consumed_since_vacuum += 1;
        }
        Ok(record)
    }

    fn vacuum_if_needed(&mut self) -> Result<bool> {
        self.ensure_initialized()?;
        let mut inner = self.lock();
        if inner.consumed_since_vacuum < self.vacuum_threshold {
            return Ok(false);
        }
        debug!(
            consumed = inner.consumed_since_vacuum,
            remaining = inner.records.len(),
            "Vacuuming memory queue"
        );
        inner.records.shrink_to_fit();
        inner.consumed_since_vacuum = 0;
        Ok(true)
    }
}

/// Several virtual queues behind one handle (typically one per command
/// family). Index 0 is the priority queue carrying machine-mode records.
pub struct MultiQueue {
    queues: Vec<Box<dyn Queue>>,
    current: usize,
}

impl std::fmt::Debug for MultiQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiQueue")
            .field("queues", &self.queues.len())
            .field("current", &self.current)
            .finish()
    }
}

impl MultiQueue {
    /// Build from at least one queue.
    pub fn new(queues: Vec<Box<dyn Queue>>) -> Result<Self> {
        if queues.is_empty() {
            return Err(QueueError::Corrupted("multi-queue needs at least one queue".into()).into());
        }
        Ok(Self { queues, current: 0 })
    }

    fn active(&mut self) -> &mut dyn Queue {
        self.queues[self.current].as_mut()
    }
}

impl Queue for MultiQueue {
    fn initialize(&mut self) -> Result<()> {
        for queue in &mut self.queues {
            if !queue.is_initialized() {
                queue.initialize()?;
            }
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.queues.iter().all(|q| q.is_initialized())
    }

    fn peek(&mut self, max: usize) -> Result<Vec<DataRecord>> {
        self.active().peek(max)
    }

    fn unsafe_dequeue(&mut self, count: usize, expected_last: &DataRecord) -> Result<bool> {
        self.active().unsafe_dequeue(count, expected_last)
    }

    fn dequeue(&mut self) -> Result<Option<DataRecord>> {
        self.active().dequeue()
    }

    fn vacuum_if_needed(&mut self) -> Result<bool> {
        let mut vacuumed = false;
        for queue in &mut self.queues {
            vacuumed |= queue.vacuum_if_needed()?;
        }
        Ok(vacuumed)
    }

    fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn current_index(&self) -> usize {
        self.current
    }

    fn move_next(&mut self) -> usize {
        self.current = (self.current + 1) % self.queues.len();
        self.current
    }

    fn reset(&mut self) {
        self.current = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::record::{Command, ModuleId};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn rec(secs: i64, value: i64) -> DataRecord {
        DataRecord::new(
            Command::MachineMode,
            ModuleId(1),
            "",
            json!(value),
            Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        )
    }

    fn ready(records: Vec<DataRecord>) -> MemoryQueue {
        let mut q = MemoryQueue::with_records(records);
        q.initialize().unwrap();
        q
    }

    #[test]
    fn operations_require_initialization() {
        let mut q = MemoryQueue::with_records([rec(0, 1)]);
        assert!(matches!(
            q.peek(1),
            Err(Error::Queue(QueueError::NotInitialized))
        ));
        q.initialize().unwrap();
        assert_eq!(q.peek(10).unwrap().len(), 1);
    }

    #[test]
    fn peek_is_non_destructive() {
        let mut q = ready(vec![rec(0, 1), rec(1, 2), rec(2, 3)]);
        assert_eq!(q.peek(2).unwrap(), vec![rec(0, 1), rec(1, 2)]);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn unsafe_dequeue_checks_last_item() {
        let mut q = ready(vec![rec(0, 1), rec(1, 2), rec(2, 3)]);
        assert!(!q.unsafe_dequeue(2, &rec(2, 3)).unwrap());
        assert_eq!(q.len(), 3);
        assert!(q.unsafe_dequeue(2, &rec(1, 2)).unwrap());
        assert_eq!(q.snapshot(), vec![rec(2, 3)]);
    }

    #[test]
    fn unsafe_dequeue_past_end_is_refused() {
        let mut q = ready(vec![rec(0, 1)]);
        assert!(!q.unsafe_dequeue(2, &rec(0, 1)).unwrap());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn clones_share_records() {
        let mut q = ready(vec![rec(0, 1), rec(1, 2)]);
        let producer = q.clone();
        assert_eq!(producer.steal_front(), Some(rec(0, 1)));
        assert_eq!(q.dequeue().unwrap(), Some(rec(1, 2)));
        assert!(producer.is_empty());
    }

    #[test]
    fn initialization_failures_are_injected() {
        let mut q = MemoryQueue::new();
        q.fail_next_initializations(2);
        assert!(q.initialize().is_err());
        assert!(q.initialize().is_err());
        assert!(q.initialize().is_ok());
        assert!(q.is_initialized());
    }

    #[test]
    fn vacuum_after_threshold() {
        let mut q = MemoryQueue::with_records((0..4).map(|i| rec(i, i)))
            .with_vacuum_threshold(3);
        q.initialize().unwrap();
        q.dequeue().unwrap();
        assert!(!q.vacuum_if_needed().unwrap());
        assert!(q.unsafe_dequeue(2, &rec(2, 2)).unwrap());
        assert!(q.vacuum_if_needed().unwrap());
        assert!(!q.vacuum_if_needed().unwrap());
    }

    #[test]
    fn multi_queue_rotates_and_resets() {
        let a = ready(vec![rec(0, 1)]);
        let b = ready(vec![rec(5, 2)]);
        let mut multi = MultiQueue::new(vec![Box::new(a) as Box<dyn Queue>, Box::new(b)]).unwrap();
        assert_eq!(multi.queue_count(), 2);
        assert_eq!(multi.peek(5).unwrap(), vec![rec(0, 1)]);
        assert_eq!(multi.move_next(), 1);
        assert_eq!(multi.peek(5).unwrap(), vec![rec(5, 2)]);
        assert_eq!(multi.move_next(), 0);
        multi.move_next();
        multi.reset();
        assert_eq!(multi.current_index(), 0);
    }

    #[test]
    fn multi_queue_initializes_members() {
        let mut multi =
            MultiQueue::new(vec![
                Box::new(MemoryQueue::new()) as Box<dyn Queue>,
                Box::new(MemoryQueue::new()),
            ])
                .unwrap();
        assert!(!multi.is_initialized());
        multi.initialize().unwrap();
        assert!(multi.is_initialized());
    }

    #[test]
    fn empty_multi_queue_is_rejected() {
        assert!(MultiQueue::new(Vec::new()).is_err());
    }
}
