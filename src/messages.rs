//! Command types for the control surface.
//!
//! External control reaches the core loop exclusively through
//! [`LabCommand`] messages; every command carries a `oneshot` channel for
//! its reply, so callers never share state with the loop. [`LabHandle`] is
//! the async wrapper a transport binding (RPC server, CLI, test) talks to.

use crate::core::{ProcessId, StepId};
use crate::error::{LabError, LabResult};
use crate::instance::{ProcessState, StepState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// Target of a pause/resume/cancel command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    All,
    Process(ProcessId),
}

/// Commands accepted by the orchestrator core loop.
#[derive(Debug)]
pub enum LabCommand {
    /// Parse and register a process; it stays idle until started.
    SubmitProcess {
        source: String,
        name: String,
        delay_minutes: Option<u32>,
        priority: i32,
        response: oneshot::Sender<LabResult<ProcessId>>,
    },

    /// Start previously submitted processes.
    Start {
        processes: Vec<ProcessId>,
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Halt new dispatches; in-flight steps continue.
    Pause {
        scope: Scope,
        response: oneshot::Sender<LabResult<()>>,
    },

    Resume {
        scope: Scope,
        response: oneshot::Sender<LabResult<()>>,
    },

    /// Cancel processes; in-flight steps are signalled cooperatively.
    Cancel {
        scope: Scope,
        response: oneshot::Sender<LabResult<()>>,
    },

    EnableSimulation {
        speed: f64,
        response: oneshot::Sender<()>,
    },

    DisableSimulation {
        response: oneshot::Sender<()>,
    },

    QueryStatus {
        process: Option<ProcessId>,
        response: oneshot::Sender<LabResult<StatusReport>>,
    },

    /// Replace the device catalogue from a lab document.
    ConfigureLab {
        document: String,
        response: oneshot::Sender<LabResult<()>>,
    },

    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Per-step view in a status report.
#[derive(Clone, Debug, Serialize)]
pub struct StepReport {
    pub id: StepId,
    pub fct: String,
    pub state: StepState,
    /// Expected finish under the live plan, or actual finish when done.
    pub eta: Option<DateTime<Utc>>,
}

/// Per-process view in a status report.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessReport {
    pub id: ProcessId,
    pub name: String,
    pub state: ProcessState,
    /// Error kind and message for `failed` processes.
    pub error: Option<String>,
    /// Most recently finished step.
    pub last_executed: Option<String>,
    /// Next step the plan intends to run, with its expected start.
    pub next_planned: Option<(String, DateTime<Utc>)>,
    pub steps: Vec<StepReport>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StatusReport {
    pub processes: Vec<ProcessReport>,
    pub simulation_active: bool,
    pub paused: bool,
}

/// Async control handle over the core loop.
#[derive(Clone)]
pub struct LabHandle {
    tx: mpsc::Sender<LabCommand>,
}

impl LabHandle {
    pub fn new(tx: mpsc::Sender<LabCommand>) -> Self {
        Self { tx }
    }

    async fn send<T>(
        &self,
        command: LabCommand,
        rx: oneshot::Receiver<LabResult<T>>,
    ) -> LabResult<T> {
        self.tx
            .send(command)
            .await
            .map_err(|_| LabError::Transport("core loop unavailable".into()))?;
        rx.await
            .map_err(|_| LabError::Transport("core loop dropped the request".into()))?
    }

    async fn send_plain<T>(&self, command: LabCommand, rx: oneshot::Receiver<T>) -> LabResult<T> {
        self.tx
            .send(command)
            .await
            .map_err(|_| LabError::Transport("core loop unavailable".into()))?;
        rx.await
            .map_err(|_| LabError::Transport("core loop dropped the request".into()))
    }

    pub async fn submit_process(
        &self,
        source: &str,
        name: &str,
        delay_minutes: Option<u32>,
        priority: i32,
    ) -> LabResult<ProcessId> {
        let (tx, rx) = oneshot::channel();
        self.send(
            LabCommand::SubmitProcess {
                source: source.to_string(),
                name: name.to_string(),
                delay_minutes,
                priority,
                response: tx,
            },
            rx,
        )
        .await
    }

    pub async fn start(&self, processes: Vec<ProcessId>) -> LabResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(
            LabCommand::Start {
                processes,
                response: tx,
            },
            rx,
        )
        .await
    }

    pub async fn pause(&self, scope: Scope) -> LabResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(LabCommand::Pause { scope, response: tx }, rx).await
    }

    pub async fn resume(&self, scope: Scope) -> LabResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(LabCommand::Resume { scope, response: tx }, rx)
            .await
    }

    pub async fn cancel(&self, scope: Scope) -> LabResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(LabCommand::Cancel { scope, response: tx }, rx)
            .await
    }

    pub async fn enable_simulation(&self, speed: f64) -> LabResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send_plain(LabCommand::EnableSimulation { speed, response: tx }, rx)
            .await
    }

    pub async fn disable_simulation(&self) -> LabResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send_plain(LabCommand::DisableSimulation { response: tx }, rx)
            .await
    }

    pub async fn query_status(&self, process: Option<ProcessId>) -> LabResult<StatusReport> {
        let (tx, rx) = oneshot::channel();
        self.send(
            LabCommand::QueryStatus {
                process,
                response: tx,
            },
            rx,
        )
        .await
    }

    pub async fn configure_lab(&self, document: &str) -> LabResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(
            LabCommand::ConfigureLab {
                document: document.to_string(),
                response: tx,
            },
            rx,
        )
        .await
    }

    pub async fn shutdown(&self) -> LabResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send_plain(LabCommand::Shutdown { response: tx }, rx)
            .await
    }
}
