//! Consolidated entities written by the strategies.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{Command, DataRecord, ModuleId};

/// Machine-mode / activity state identifier.
pub type StateId = i64;

/// Intervals shorter than this stay in memory and are never persisted standalone.
pub const MIN_PERSISTED_LENGTH: TimeDelta = TimeDelta::seconds(1);

/// Which interval table an interval belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalKind {
    /// Machine-mode facts
    MachineMode,
    /// Module activity periods
    ModuleActivity,
}

impl IntervalKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MachineMode => "machine_mode",
            Self::ModuleActivity => "module_activity",
        }
    }

    #[must_use]
    pub fn command(self) -> Command {
        match self {
            Self::MachineMode => Command::MachineMode,
            Self::ModuleActivity => Command::ModuleActivity,
        }
    }
}

impl fmt::Display for IntervalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A span of constant state `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateInterval {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub state: StateId,
}

impl StateInterval {
    #[must_use]
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>, state: StateId) -> Self {
        Self { begin, end, state }
    }

    #[must_use]
    pub fn length(&self) -> TimeDelta {
        self.end - self.begin
    }

    /// Long enough to be written to storage.
    #[must_use]
    pub fn is_persistable(&self) -> bool {
        self.length() >= MIN_PERSISTED_LENGTH
    }
}

/// Natural key of an alarm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlarmKey {
    #[serde(default)]
    pub cnc_info: String,
    #[serde(default)]
    pub cnc_sub_info: String,
    #[serde(rename = "type", default)]
    pub alarm_type: String,
    pub number: String,
}

impl fmt::Display for AlarmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.cnc_info, self.cnc_sub_info, self.alarm_type, self.number
        )
    }
}

/// One alarm as reported inside an `alarms` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmObservation {
    #[serde(flatten)]
    pub key: AlarmKey,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// A consolidated alarm occurrence `[begin, end]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmInterval {
    pub key: AlarmKey,
    pub message: String,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Still believed active; cleared when a later snapshot omits the key.
    pub open: bool,
}

impl AlarmInterval {
    #[must_use]
    pub fn opened(observation: &AlarmObservation, begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            key: observation.key.clone(),
            message: observation.message.clone(),
            properties: observation.properties.clone(),
            begin,
            end,
            open: true,
        }
    }
}

/// One value of a CNC variable over `[begin, end)`; `end == None` is unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub key: String,
    pub payload: serde_json::Value,
    pub begin: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl VariableRecord {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.begin <= at && self.end.is_none_or(|end| at < end)
    }
}

/// What an append-only detection refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectionKind {
    Stamp { stamp_id: i64 },
    Milestone { sequence: i64, milestone_secs: f64 },
}

/// One append-only detection log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub module: ModuleId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: DetectionKind,
}

/// Last record consolidated for one `(module, command)` stream.
///
/// Redelivered batches end at or before the marker. A batch ending exactly
/// at the marker is only a redelivery when its last record carries the same
/// content; a different record at the same instant is new data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionMarker {
    pub at: DateTime<Utc>,
    /// Compact JSON of the last record's value.
    pub content: String,
}

impl AcquisitionMarker {
    #[must_use]
    pub fn of(record: &DataRecord) -> Self {
        Self {
            at: record.timestamp,
            content: record.value.to_string(),
        }
    }

    /// Was a batch ending with `last` already consolidated?
    #[must_use]
    pub fn covers(&self, last: &DataRecord) -> bool {
        last.timestamp < self.at
            || (last.timestamp == self.at && last.value.to_string() == self.content)
    }
}

/// Severity of an operator-visible import log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportLogLevel {
    Warning,
    Error,
}

impl ImportLogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Operator-visible anomaly recorded alongside the consolidated data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportLogEntry {
    pub module: ModuleId,
    pub at: DateTime<Utc>,
    pub level: ImportLogLevel,
    pub message: String,
}
