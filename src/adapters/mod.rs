//! Device adapter interface.
//!
//! Adapters translate a dispatched step into a concrete device command and
//! expose a stream of observations back to the executor. Wire protocols,
//! vendor quirks and retries live entirely behind this trait; the core
//! assumes only submit / observe / cancel.

pub mod simulated;

pub use simulated::SimulatedAdapter;

use crate::core::{ContainerId, DeviceKind, ParamValue, Params, StepId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Observed status of an in-flight operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpStatus {
    Started,
    Running,
    Ok,
    Failed,
    Cancelled,
    Timeout,
}

impl OpStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OpStatus::Ok | OpStatus::Failed | OpStatus::Cancelled | OpStatus::Timeout
        )
    }
}

/// One observation from a device adapter.
#[derive(Clone, Debug)]
pub struct Observation {
    pub status: OpStatus,
    /// Completion fraction in [0, 1].
    pub progress: f64,
    /// Return value, on the terminal `Ok` observation of producing steps.
    pub value: Option<ParamValue>,
    pub error: Option<String>,
}

impl Observation {
    pub fn started() -> Self {
        Self {
            status: OpStatus::Started,
            progress: 0.0,
            value: None,
            error: None,
        }
    }

    pub fn running(progress: f64) -> Self {
        Self {
            status: OpStatus::Running,
            progress,
            value: None,
            error: None,
        }
    }

    pub fn ok(value: Option<ParamValue>) -> Self {
        Self {
            status: OpStatus::Ok,
            progress: 1.0,
            value,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OpStatus::Failed,
            progress: 0.0,
            value: None,
            error: Some(error.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: OpStatus::Cancelled,
            progress: 0.0,
            value: None,
            error: None,
        }
    }
}

/// Everything an adapter needs to run one scheduled step.
#[derive(Clone, Debug)]
pub struct StepDispatch {
    pub step: StepId,
    pub fct: String,
    pub device: String,
    pub device_kind: DeviceKind,
    pub containers: Vec<ContainerId>,
    pub params: Params,
    pub scheduled_duration: Duration,
    pub is_movement: bool,
}

/// Handle on one submitted operation.
#[async_trait]
pub trait OperationHandle: Send {
    /// Takes the observation stream; yields until a terminal status.
    fn observations(&mut self) -> Option<mpsc::Receiver<Observation>>;

    /// Requests a cooperative cancel; `true` when the device honours it.
    async fn cancel(&mut self) -> bool;
}

/// A driver for one kind of device.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    async fn submit(&self, dispatch: StepDispatch) -> anyhow::Result<Box<dyn OperationHandle>>;
}

/// Routes dispatches to the adapter registered for each device kind.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    by_kind: HashMap<DeviceKind, Arc<dyn DeviceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry backed entirely by simulated adapters.
    pub fn simulated(speed: f64) -> Self {
        let adapter: Arc<dyn DeviceAdapter> = Arc::new(SimulatedAdapter::new(speed));
        let mut by_kind = HashMap::new();
        for kind in [
            DeviceKind::Incubator,
            DeviceKind::PlateReader,
            DeviceKind::LiquidHandler,
            DeviceKind::Mover,
            DeviceKind::Centrifuge,
            DeviceKind::Storage,
        ] {
            by_kind.insert(kind, Arc::clone(&adapter));
        }
        Self { by_kind }
    }

    pub fn register(&mut self, kind: DeviceKind, adapter: Arc<dyn DeviceAdapter>) {
        self.by_kind.insert(kind, adapter);
    }

    pub fn adapter_for(&self, kind: DeviceKind) -> Option<Arc<dyn DeviceAdapter>> {
        self.by_kind.get(&kind).cloned()
    }
}
