//! Append-only history of executed steps.

use crate::core::{ContainerId, DeviceKind, ParamValue, Params, Position};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Terminal status of an executed step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed,
    Cancelled,
}

/// Movement-specific detail on a history record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MovementRecord {
    pub origin: Position,
    pub destination: Position,
    pub source_kind: DeviceKind,
    pub target_kind: DeviceKind,
    /// Whether the container travelled with its lid on.
    pub lidded: bool,
    /// Where the lid was parked when it travelled open.
    pub lid_parked_at: Option<Position>,
}

/// One executed step, as committed by the executor.
///
/// Records are append-only; nothing ever mutates or deletes them. The
/// duration estimator reads them back to predict future step durations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Groups all records of one workflow execution.
    pub experiment: Uuid,
    /// Operation function name.
    pub step_name: String,
    pub device: String,
    pub device_kind: DeviceKind,
    pub containers: Vec<ContainerId>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub status: StepStatus,
    /// Return value for producing operations.
    pub value: Option<ParamValue>,
    /// Free-form parameter bag of the operation.
    pub params: Params,
    pub movement: Option<MovementRecord>,
    pub is_simulation: bool,
}

impl HistoryRecord {
    /// Observed wall-clock duration of the step.
    pub fn elapsed(&self) -> Duration {
        (self.finished - self.started).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_elapsed_never_negative() {
        let now = Utc::now();
        let record = HistoryRecord {
            experiment: Uuid::new_v4(),
            step_name: "measure".into(),
            device: "Reader".into(),
            device_kind: DeviceKind::PlateReader,
            containers: vec![ContainerId(0)],
            started: now,
            finished: now - TimeDelta::seconds(5),
            status: StepStatus::Ok,
            value: None,
            params: Params::new(),
            movement: None,
            is_simulation: false,
        };
        assert_eq!(record.elapsed(), Duration::ZERO);
    }
}
