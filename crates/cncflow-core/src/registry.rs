//! Closed command → strategy dispatch for one module.

use crate::cancel::CancelToken;
use crate::config::StrategiesConfig;
use crate::error::Result;
use crate::record::{Command, DataRecord, ModuleId};
use crate::storage::Store;
use crate::strategy::{
    AlarmStrategy, ApplyReport, Consolidate, IntervalStrategy, MilestoneStrategy, StampStrategy,
    VariableStrategy,
};

/// One strategy per [`Command`], owned by a single scheduler.
#[derive(Debug)]
pub struct StrategyRegistry {
    module: ModuleId,
    machine_mode: IntervalStrategy,
    module_activity: IntervalStrategy,
    alarms: AlarmStrategy,
    variables: VariableStrategy,
    stamp: StampStrategy,
    milestone: MilestoneStrategy,
}

impl StrategyRegistry {
    #[must_use]
    pub fn from_config(module: ModuleId, config: &StrategiesConfig) -> Self {
        Self {
            module,
            machine_mode: IntervalStrategy::machine_mode(module, config.machine_mode_max_gap()),
            module_activity: IntervalStrategy::module_activity(
                module,
                config.activity_max_gap(),
                config.activity_default_state,
            ),
            alarms: AlarmStrategy::new(module, config.alarms_max_gap()),
            variables: VariableStrategy::new(module, config.variables_max_gap()),
            stamp: StampStrategy::new(module, config.stamps_max_gap(), config.auto_create_stamps),
            milestone: MilestoneStrategy::new(module),
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// Batching predicate for the strategy selected by `tail`'s command.
    pub fn is_compatible<S: Store>(&self, tail: &DataRecord, candidate: &DataRecord) -> bool {
        match tail.command {
            Command::MachineMode => {
                Consolidate::<S>::is_compatible(&self.machine_mode, tail, candidate)
            }
            Command::ModuleActivity => {
                Consolidate::<S>::is_compatible(&self.module_activity, tail, candidate)
            }
            Command::Alarms => Consolidate::<S>::is_compatible(&self.alarms, tail, candidate),
            Command::Variables => Consolidate::<S>::is_compatible(&self.variables, tail, candidate),
            Command::Stamp => Consolidate::<S>::is_compatible(&self.stamp, tail, candidate),
            Command::Milestone => Consolidate::<S>::is_compatible(&self.milestone, tail, candidate),
        }
    }

    /// Dispatch `batch` to the strategy of its command.
    pub fn apply<S: Store>(
        &mut self,
        command: Command,
        batch: &[DataRecord],
        store: &S,
        cancel: &CancelToken,
    ) -> Result<ApplyReport> {
        match command {
            Command::MachineMode => self.machine_mode.apply(batch, store, cancel),
            Command::ModuleActivity => self.module_activity.apply(batch, store, cancel),
            Command::Alarms => self.alarms.apply(batch, store, cancel),
            Command::Variables => self.variables.apply(batch, store, cancel),
            Command::Stamp => self.stamp.apply(batch, store, cancel),
            Command::Milestone => self.milestone.apply(batch, store, cancel),
        }
    }
}
