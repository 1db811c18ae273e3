//! Service runner: one scheduler per machine module.
//!
//! Each scheduler runs its synchronous loop on a blocking tokio task. All of
//! them share one store and one [`CancelToken`]. A fatal fault in any module
//! cancels the rest and is returned from [`ServiceHandle::join`], so the
//! binary can terminate the process.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::queue::Queue;
use crate::record::ModuleId;
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::storage::Store;

/// How each scheduler of a service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Loop until shutdown or a fatal fault.
    #[default]
    Continuous,
    /// Consolidate what is queued now, then finish.
    Drain,
}

/// Spawns and supervises per-module schedulers.
#[derive(Debug)]
pub struct ImportService<S> {
    store: Arc<S>,
    config: Config,
}

impl<S: Store + 'static> ImportService<S> {
    #[must_use]
    pub fn new(store: Arc<S>, config: Config) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Start one scheduler per `(module, queue)` pair.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<Q>(&self, modules: impl IntoIterator<Item = (ModuleId, Q)>) -> ServiceHandle
    where
        Q: Queue + 'static,
    {
        self.spawn_with(RunMode::Continuous, modules)
    }

    /// Like [`ImportService::spawn`], with an explicit [`RunMode`].
    pub fn spawn_with<Q>(
        &self,
        mode: RunMode,
        modules: impl IntoIterator<Item = (ModuleId, Q)>,
    ) -> ServiceHandle
    where
        Q: Queue + 'static,
    {
        let cancel = CancelToken::new();
        let mut tasks = JoinSet::new();
        for (module, queue) in modules {
            let store = Arc::clone(&self.store);
            let config = self.config.clone();
            let cancel = cancel.clone();
            tasks.spawn_blocking(move || {
                let mut scheduler = Scheduler::new(module, queue, store, &config, cancel);
                let stats = match mode {
                    RunMode::Continuous => scheduler.run(),
                    RunMode::Drain => scheduler.drain(),
                };
                (module, stats)
            });
            info!(module_id = %module, ?mode, "Spawned module scheduler");
        }
        ServiceHandle { cancel, tasks }
    }
}

/// Owner side of a running service.
#[derive(Debug)]
pub struct ServiceHandle {
    cancel: CancelToken,
    tasks: JoinSet<(ModuleId, Result<SchedulerStats>)>,
}

impl ServiceHandle {
    /// Token shared by every scheduler (e.g. for a signal handler).
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Ask every scheduler to stop after its current step.
    pub fn shutdown(&self) {
        info!(modules = self.tasks.len(), "Shutting down import service");
        self.cancel.cancel();
    }

    /// Wait for every scheduler to finish.
    ///
    /// Returns per-module statistics, or the first fatal fault. A fatal
    /// fault cancels the remaining schedulers before they are awaited.
    pub async fn join(mut self) -> Result<Vec<(ModuleId, SchedulerStats)>> {
        let mut finished = Vec::new();
        let mut fatal = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((module, Ok(stats))) => finished.push((module, stats)),
                Ok((module, Err(e))) => {
                    error!(module_id = %module, error = %e, "Module scheduler failed; stopping service");
                    self.cancel.cancel();
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Module scheduler task panicked; stopping service");
                    self.cancel.cancel();
                    fatal.get_or_insert(Error::Invariant(format!("scheduler task failed: {e}")));
                }
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => {
                finished.sort_by_key(|(module, _)| *module);
                Ok(finished)
            }
        }
    }
}
