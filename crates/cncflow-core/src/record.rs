//! Data records: the immutable unit read from a module's durable queue.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Command tag carried by every record; selects the consolidation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Machine-mode change; consolidated into fact intervals
    MachineMode,
    /// Module activity signal; consolidated into gap-filled activity periods
    ModuleActivity,
    /// Snapshot of the currently active alarms
    Alarms,
    /// Snapshot of CNC variable values
    Variables,
    /// Stamp detection (references a pre-existing stamp)
    Stamp,
    /// Sequence milestone progress; only the latest value matters
    Milestone,
}

impl Command {
    pub const ALL: [Self; 6] = [
        Self::MachineMode,
        Self::ModuleActivity,
        Self::Alarms,
        Self::Variables,
        Self::Stamp,
        Self::Milestone,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MachineMode => "machine_mode",
            Self::ModuleActivity => "module_activity",
            Self::Alarms => "alarms",
            Self::Variables => "variables",
            Self::Stamp => "stamp",
            Self::Milestone => "milestone",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown command: {s}"))
    }
}

/// Identifier of a machine module (one scheduler per module).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ModuleId(pub u64);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One timestamped event produced by a shop-floor collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub command: Command,
    pub module_id: ModuleId,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: serde_json::Value,
    /// Millisecond precision, the resolution of persisted timestamps.
    #[serde(deserialize_with = "deserialize_millis")]
    pub timestamp: DateTime<Utc>,
}

/// Drop sub-millisecond digits so cached and stored instants agree.
#[must_use]
pub fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    DateTime::<Utc>::deserialize(deserializer).map(truncate_millis)
}

impl DataRecord {
    #[must_use]
    pub fn new(
        command: Command,
        module_id: ModuleId,
        key: impl Into<String>,
        value: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            command,
            module_id,
            key: key.into(),
            value,
            timestamp: truncate_millis(timestamp),
        }
    }

    /// Same key and same value, ignoring the timestamp.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value
    }

    /// Same source module and same command.
    #[must_use]
    pub fn same_stream(&self, other: &Self) -> bool {
        self.module_id == other.module_id && self.command == other.command
    }
}
