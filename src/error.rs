//! Error types for the orchestrator.
//!
//! [`LabError`] is the top-level error enum for the whole application.
//! Invariant violations in the status store have their own sub-enum,
//! [`StateConflict`], because every mutating store operation rejects (never
//! silently corrects) an operation that would break an invariant, and callers
//! need to see exactly which invariant would have been broken.
//!
//! Scheduler infeasibility is deliberately *not* modeled here as a panic or
//! an opaque failure: it is a normal, recoverable condition carried as an
//! explicit result value (see `sched::SchedError`), so the executor can keep
//! driving the previous feasible plan.

use crate::config::ConfigError;
use crate::core::{ContainerId, Position, ProcessId, StepId};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

#[derive(Debug, Error)]
pub enum LabError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateConflict),

    #[error("process {process} is unschedulable: {reason}")]
    Unschedulable { process: ProcessId, reason: String },

    #[error("step {step} failed: {cause}")]
    StepFailure { step: StepId, cause: String },

    #[error("cancelled")]
    Cancelled,

    #[error("device transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persist(String),

    #[error("unknown process: {0}")]
    UnknownProcess(ProcessId),

    #[error("graph error: {0}")]
    Graph(#[from] crate::graph::GraphError),

    #[error("process source could not be parsed: {0}")]
    Parse(String),
}

/// A status-store invariant that a mutating operation would have violated.
///
/// These are rejections: when one of these is returned, no state was changed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateConflict {
    #[error("position {0} is already occupied")]
    PositionOccupied(Position),

    #[error("no container at source position {0}")]
    SourceEmpty(Position),

    #[error("destination position {0} is occupied")]
    DestOccupied(Position),

    #[error("barcode {barcode} identifies a different container than the one at {position}")]
    AmbiguousSource { position: Position, barcode: String },

    #[error("container at {position} carries barcode {found:?}, expected {expected}")]
    BarcodeMismatch {
        position: Position,
        expected: String,
        found: Option<String>,
    },

    #[error("barcode {0} is already assigned to another container")]
    BarcodeTaken(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("device {0} has no free compatible slot")]
    DeviceFull(String),

    #[error("slot {0} does not exist on the device")]
    InvalidSlot(Position),

    #[error("position {0} is not suited for deep-well labware")]
    DeepWellUnsuited(Position),

    #[error("unknown container: {0}")]
    UnknownContainer(ContainerId),

    #[error("container {0} has been removed from the lab")]
    ContainerRemoved(ContainerId),

    #[error("container {0} is not lidded")]
    NotLidded(ContainerId),

    #[error("container {0} is already lidded")]
    AlreadyLidded(ContainerId),

    #[error("lid of container {container} is not at {position}")]
    LidNotAt {
        container: ContainerId,
        position: Position,
    },

    #[error("container catalogue mismatch: {0}")]
    CatalogueMismatch(String),
}
