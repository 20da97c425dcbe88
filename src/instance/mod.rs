//! The scheduling instance: union of all live workflows plus device state.
//!
//! This is the single mutable aggregation the core loop owns. Submitted
//! graphs are flattened into a global arena of step entries (operations
//! only; value and branch nodes stay in their graph and are tracked as
//! resolved values per process). Capacity accounting and readiness live
//! here so the scheduler itself stays a pure function over a snapshot.
//!
//! Step life cycle: `Pending → Ready → Running → {Completed, Failed,
//! Cancelled}`, with `Blocked` entered when a dispatch-time precondition
//! fails (cleared by the next re-plan) and `Pruned` for operations on the
//! losing arm of a resolved branch.

use crate::core::{
    canonical_params, ContainerId, DeviceId, DeviceKind, NodeId, ParamValue, ProcessId, StepId,
};
use crate::error::{LabError, LabResult};
use crate::estimator::{DurationEstimator, EstimateKey};
use crate::graph::{Node, OperationNode, WorkflowGraph};
use crate::store::persistence::{ExperimentRow, JournalEvent, ProcessRow};
use crate::store::{ContainerSpec, StatusStore};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Life-cycle state of one step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Blocked,
    Completed,
    Failed,
    Cancelled,
    /// On the losing arm of a resolved branch; never runs.
    Pruned,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Cancelled | StepState::Pruned
        )
    }

    /// Whether a successor may treat this predecessor as satisfied.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, StepState::Completed | StepState::Pruned)
    }
}

/// Life-cycle state of one process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Failed | ProcessState::Cancelled
        )
    }
}

/// Wait window on a dependency between two steps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WaitConstraint {
    pub min: Duration,
    pub max: Option<Duration>,
    /// Cost per second of idle time between the endpoints.
    pub cost: f64,
}

impl WaitConstraint {
    pub fn ordering_only() -> Self {
        Self {
            min: Duration::ZERO,
            max: None,
            cost: 0.0,
        }
    }
}

/// One schedulable operation in the global arena.
#[derive(Clone, Debug)]
pub struct StepEntry {
    pub id: StepId,
    pub process: ProcessId,
    pub node: NodeId,
    pub op: OperationNode,
    pub containers: Vec<ContainerId>,
    pub preds: Vec<(StepId, WaitConstraint)>,
    pub succs: Vec<StepId>,
    /// Branch guards: the step may only dispatch once every listed branch
    /// has resolved to the required arm.
    pub guards: Vec<(NodeId, bool)>,
    pub state: StepState,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// Device the step was dispatched to, while running.
    pub running_on: Option<DeviceId>,
}

struct ProcessEntry {
    id: ProcessId,
    name: String,
    priority: i32,
    state: ProcessState,
    experiment: Uuid,
    graph: WorkflowGraph,
    /// Graph-local container name -> store id.
    containers: HashMap<String, ContainerId>,
    /// Resolved numeric values of variable/computation nodes.
    values: HashMap<NodeId, f64>,
    /// Raw values as returned by operations.
    raw_values: HashMap<NodeId, ParamValue>,
    /// Resolved branch arms.
    branch_arms: HashMap<NodeId, bool>,
    /// Operation node -> step id.
    steps: HashMap<NodeId, StepId>,
    delay: Duration,
    /// Set when the process is started; dispatch waits out the delay.
    started_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

/// What a completed step resolved downstream.
#[derive(Debug, Default)]
pub struct CompletionEffects {
    pub resolved_branches: Vec<(ProcessId, NodeId, bool)>,
    pub pruned_steps: Vec<StepId>,
    pub finished_process: Option<(ProcessId, ProcessState)>,
}

// ---------------------------------------------------------------------
// Snapshot handed to the scheduler
// ---------------------------------------------------------------------

/// Immutable device view for planning.
#[derive(Clone, Debug)]
pub struct SnapshotDevice {
    pub id: DeviceId,
    pub name: String,
    pub kind: DeviceKind,
    pub capacity: u32,
    pub process_capacity: u32,
    pub min_capacity: u32,
    pub allows_overlap: bool,
}

/// Dependency of a snapshot step.
#[derive(Clone, Copy, Debug)]
pub struct SnapshotDep {
    pub pred: StepId,
    pub min: Duration,
    pub max: Option<Duration>,
    pub cost: f64,
}

/// One step the scheduler must place.
#[derive(Clone, Debug)]
pub struct SnapshotStep {
    pub id: StepId,
    pub process: ProcessId,
    pub priority: i32,
    pub fct: String,
    pub kind: DeviceKind,
    pub duration: Duration,
    pub containers: Vec<ContainerId>,
    pub deps: Vec<SnapshotDep>,
    pub is_movement: bool,
    /// Compatibility key for bundling on minimum-occupancy devices.
    pub batch_key: String,
    pub earliest_allowed: DateTime<Utc>,
    /// Total wait cost on incoming edges; scheduler tie-break input.
    pub wait_cost_sum: f64,
}

/// An operation currently executing on a device.
#[derive(Clone, Debug)]
pub struct RunningStep {
    pub id: StepId,
    pub device: DeviceId,
    pub started: DateTime<Utc>,
    pub expected_finish: DateTime<Utc>,
    pub containers: Vec<ContainerId>,
    pub is_movement: bool,
}

/// Frozen view of the instance for one scheduler invocation.
#[derive(Clone, Debug)]
pub struct InstanceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub devices: Vec<SnapshotDevice>,
    pub steps: Vec<SnapshotStep>,
    pub running: Vec<RunningStep>,
    /// Finish instants for steps no longer subject to planning.
    pub fixed_finish: HashMap<StepId, DateTime<Utc>>,
    /// Current device of each live container.
    pub container_device: HashMap<ContainerId, DeviceId>,
}

// ---------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct SchedulingInstance {
    processes: HashMap<ProcessId, ProcessEntry>,
    steps: Vec<StepEntry>,
    next_process: u32,
}

impl SchedulingInstance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self, id: StepId) -> Option<&StepEntry> {
        self.steps.get(id.0 as usize)
    }

    fn step_mut(&mut self, id: StepId) -> Option<&mut StepEntry> {
        self.steps.get_mut(id.0 as usize)
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepEntry> {
        self.steps.iter()
    }

    pub fn process_ids(&self) -> Vec<ProcessId> {
        let mut ids: Vec<ProcessId> = self.processes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn process_state(&self, id: ProcessId) -> Option<ProcessState> {
        self.processes.get(&id).map(|p| p.state)
    }

    pub fn process_name(&self, id: ProcessId) -> Option<&str> {
        self.processes.get(&id).map(|p| p.name.as_str())
    }

    pub fn process_error(&self, id: ProcessId) -> Option<&str> {
        self.processes.get(&id).and_then(|p| p.error.as_deref())
    }

    pub fn process_experiment(&self, id: ProcessId) -> Option<Uuid> {
        self.processes.get(&id).map(|p| p.experiment)
    }

    pub fn process_priority(&self, id: ProcessId) -> i32 {
        self.processes.get(&id).map(|p| p.priority).unwrap_or(0)
    }

    pub fn steps_of(&self, process: ProcessId) -> Vec<&StepEntry> {
        let mut steps: Vec<&StepEntry> =
            self.steps.iter().filter(|s| s.process == process).collect();
        steps.sort_by_key(|s| s.id);
        steps
    }

    /// Whether any process still has live work.
    pub fn has_live_work(&self) -> bool {
        self.processes.values().any(|p| !p.state.is_terminal())
    }

    /// Steps currently executing on a device.
    ///
    /// Together with the plan's per-device queue this is the full device
    /// view: what runs now and what is committed to run next.
    pub fn device_running(&self, device: DeviceId) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.state == StepState::Running && s.running_on == Some(device))
            .map(|s| s.id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Submission and control
    // ------------------------------------------------------------------

    /// Registers a workflow, creating or adopting its containers.
    ///
    /// Containers already sitting at a labware node's starting position are
    /// adopted; missing ones are created in the store.
    pub fn submit(
        &mut self,
        graph: WorkflowGraph,
        priority: i32,
        delay: Duration,
        store: &mut StatusStore,
    ) -> LabResult<ProcessId> {
        let process_id = ProcessId(self.next_process);

        // Resolve labware to concrete containers first; any conflict aborts
        // the submission before it registers anything.
        let mut containers: HashMap<String, ContainerId> = HashMap::new();
        for (_, labware) in graph.labware() {
            let device = store
                .device_by_name(&labware.device)
                .ok_or_else(|| crate::error::StateConflict::UnknownDevice(labware.device.clone()))?
                .id;
            let pos = crate::core::Position::new(device, labware.slot);
            let id = match store.container_at(pos) {
                Some(existing) => existing.id,
                None => store.add_container(ContainerSpec {
                    barcode: None,
                    device: labware.device.clone(),
                    slot: Some(labware.slot),
                    lidded: labware.lidded,
                    labware_type: labware.labware_type.clone(),
                    deep_well: labware.deep_well,
                })?,
            };
            containers.insert(labware.container.clone(), id);
        }

        // Operation-level dependency closure: value and branch nodes pass
        // ordering through; direct operation edges keep their wait window.
        let topo = graph.topo_order();
        let mut op_ancestors: HashMap<NodeId, Vec<(NodeId, WaitConstraint)>> = HashMap::new();
        for node_id in &topo {
            let mut ancestors: Vec<(NodeId, WaitConstraint)> = Vec::new();
            for edge in graph.incoming(*node_id) {
                match graph.node(edge.from) {
                    Node::Operation(_) => ancestors.push((
                        edge.from,
                        WaitConstraint {
                            min: edge.min_wait.unwrap_or_default(),
                            max: edge.max_wait,
                            cost: edge.wait_cost,
                        },
                    )),
                    _ => {
                        if let Some(upstream) = op_ancestors.get(&edge.from) {
                            for (op, _) in upstream {
                                ancestors.push((*op, WaitConstraint::ordering_only()));
                            }
                        }
                    }
                }
            }
            ancestors.sort_by_key(|(op, _)| *op);
            ancestors.dedup_by_key(|(op, _)| *op);
            op_ancestors.insert(*node_id, ancestors);
        }

        // Branch guards: operations exclusive to an arm wait for it.
        let mut guards: HashMap<NodeId, Vec<(NodeId, bool)>> = HashMap::new();
        for (branch_id, node) in graph.nodes() {
            if !matches!(node, Node::Branch { .. }) {
                continue;
            }
            for arm in [true, false] {
                for member in graph.arm_exclusive(branch_id, arm) {
                    if graph.node(member).as_operation().is_some() {
                        guards.entry(member).or_default().push((branch_id, arm));
                    }
                }
            }
        }

        // Create step entries in topo order so ids follow the graph.
        let mut node_steps: HashMap<NodeId, StepId> = HashMap::new();
        for node_id in &topo {
            let Some(op) = graph.node(*node_id).as_operation() else {
                continue;
            };
            let step_id = StepId(self.steps.len() as u64);
            let step_containers: Vec<ContainerId> = op
                .containers
                .iter()
                .filter_map(|name| containers.get(name).copied())
                .collect();
            let preds: Vec<(StepId, WaitConstraint)> = op_ancestors
                .get(node_id)
                .map(|ancestors| {
                    ancestors
                        .iter()
                        .filter_map(|(op_node, constraint)| {
                            node_steps.get(op_node).map(|s| (*s, *constraint))
                        })
                        .collect()
                })
                .unwrap_or_default();
            self.steps.push(StepEntry {
                id: step_id,
                process: process_id,
                node: *node_id,
                op: op.clone(),
                containers: step_containers,
                preds,
                succs: Vec::new(),
                guards: guards.get(node_id).cloned().unwrap_or_default(),
                state: StepState::Pending,
                started: None,
                finished: None,
                running_on: None,
            });
            node_steps.insert(*node_id, step_id);
        }
        let new_steps: Vec<StepId> = node_steps.values().copied().collect();
        for step_id in new_steps {
            let preds: Vec<StepId> = self.steps[step_id.0 as usize]
                .preds
                .iter()
                .map(|(p, _)| *p)
                .collect();
            for pred in preds {
                self.steps[pred.0 as usize].succs.push(step_id);
            }
        }

        let experiment = Uuid::new_v4();
        let name = graph.name().to_string();
        if let Some(journal) = store.journal() {
            journal.record(JournalEvent::Experiment(ExperimentRow {
                uuid: experiment,
                process_name: name.clone(),
                started: Utc::now(),
            }));
            journal.record(JournalEvent::Process(ProcessRow {
                id: process_id,
                name: name.clone(),
                state: "created".into(),
                experiment,
            }));
        }

        info!(
            process = %process_id,
            name = %name,
            steps = node_steps.len(),
            "process submitted"
        );
        self.processes.insert(
            process_id,
            ProcessEntry {
                id: process_id,
                name,
                priority,
                state: ProcessState::Created,
                experiment,
                graph,
                containers,
                values: HashMap::new(),
                raw_values: HashMap::new(),
                branch_arms: HashMap::new(),
                steps: node_steps,
                delay,
                started_at: None,
                error: None,
            },
        );
        self.next_process += 1;
        Ok(process_id)
    }

    /// Starts created processes; the configured delay counts from here.
    pub fn start(&mut self, ids: &[ProcessId], now: DateTime<Utc>) -> LabResult<()> {
        for id in ids {
            let process = self
                .processes
                .get_mut(id)
                .ok_or(LabError::UnknownProcess(*id))?;
            match process.state {
                ProcessState::Created => {
                    process.state = ProcessState::Running;
                    process.started_at =
                        Some(now + TimeDelta::from_std(process.delay).unwrap_or_default());
                    info!(process = %id, "process started");
                }
                // Starting a running process is idempotent.
                ProcessState::Running | ProcessState::Paused => {}
                state => {
                    warn!(process = %id, ?state, "start ignored in terminal state");
                }
            }
        }
        Ok(())
    }

    pub fn pause(&mut self, id: ProcessId) -> LabResult<()> {
        let process = self
            .processes
            .get_mut(&id)
            .ok_or(LabError::UnknownProcess(id))?;
        if process.state == ProcessState::Running {
            process.state = ProcessState::Paused;
        }
        Ok(())
    }

    pub fn resume(&mut self, id: ProcessId) -> LabResult<()> {
        let process = self
            .processes
            .get_mut(&id)
            .ok_or(LabError::UnknownProcess(id))?;
        if process.state == ProcessState::Paused {
            process.state = ProcessState::Running;
        }
        Ok(())
    }

    /// Cancels a process; returns the in-flight steps to signal.
    ///
    /// Not-yet-started steps are cancelled immediately; running ones keep
    /// going until the adapter honours (or ignores) the cancel signal.
    pub fn cancel(&mut self, id: ProcessId) -> LabResult<Vec<StepId>> {
        let process = self
            .processes
            .get_mut(&id)
            .ok_or(LabError::UnknownProcess(id))?;
        if process.state.is_terminal() {
            return Ok(Vec::new());
        }
        process.state = ProcessState::Cancelled;
        let mut running = Vec::new();
        for step in self.steps.iter_mut().filter(|s| s.process == id) {
            match step.state {
                StepState::Pending | StepState::Ready | StepState::Blocked => {
                    step.state = StepState::Cancelled;
                }
                StepState::Running => running.push(step.id),
                _ => {}
            }
        }
        info!(process = %id, in_flight = running.len(), "process cancelled");
        Ok(running)
    }

    /// Fails a process outright (e.g. proven unschedulable).
    pub fn fail_process(&mut self, id: ProcessId, reason: &str) {
        let Some(process) = self.processes.get_mut(&id) else {
            return;
        };
        if process.state.is_terminal() {
            return;
        }
        process.state = ProcessState::Failed;
        process.error = Some(reason.to_string());
        for step in self.steps.iter_mut().filter(|s| s.process == id) {
            if matches!(
                step.state,
                StepState::Pending | StepState::Ready | StepState::Blocked
            ) {
                step.state = StepState::Cancelled;
            }
        }
        warn!(process = %id, reason, "process failed");
    }

    // ------------------------------------------------------------------
    // Readiness and step transitions
    // ------------------------------------------------------------------

    /// Steps whose predecessors are complete, guards resolved, and whose
    /// containers are idle and compatibly located.
    pub fn ready_steps(&self, store: &StatusStore, now: DateTime<Utc>) -> Vec<StepId> {
        let busy: HashSet<ContainerId> = self
            .steps
            .iter()
            .filter(|s| s.state == StepState::Running)
            .flat_map(|s| s.containers.iter().copied())
            .collect();

        let mut ready = Vec::new();
        for step in &self.steps {
            if !matches!(step.state, StepState::Pending | StepState::Ready) {
                continue;
            }
            let Some(process) = self.processes.get(&step.process) else {
                continue;
            };
            if process.state != ProcessState::Running {
                continue;
            }
            if let Some(start) = process.started_at {
                if start > now {
                    continue;
                }
            } else {
                continue;
            }
            let preds_done = step.preds.iter().all(|(pred, _)| {
                self.step(*pred)
                    .map(|p| p.state.satisfies_dependents())
                    .unwrap_or(false)
            });
            if !preds_done {
                continue;
            }
            let guards_ok = step
                .guards
                .iter()
                .all(|(branch, arm)| process.branch_arms.get(branch) == Some(arm));
            if !guards_ok {
                continue;
            }
            if step.containers.iter().any(|c| busy.contains(c)) {
                continue;
            }
            let located = step.containers.iter().all(|c| {
                let Some(container) = store.container(*c) else {
                    return false;
                };
                if container.removed {
                    return false;
                }
                if step.op.is_movement {
                    return true;
                }
                store
                    .device(container.current_pos.device)
                    .is_some_and(|d| d.kind == step.op.device_kind)
            });
            if !located {
                continue;
            }
            ready.push(step.id);
        }
        ready
    }

    pub fn mark_ready(&mut self, id: StepId) {
        if let Some(step) = self.step_mut(id) {
            if step.state == StepState::Pending {
                step.state = StepState::Ready;
            }
        }
    }

    pub fn mark_running(&mut self, id: StepId, device: DeviceId, now: DateTime<Utc>) {
        if let Some(step) = self.step_mut(id) {
            step.state = StepState::Running;
            step.started = Some(now);
            step.running_on = Some(device);
        }
    }

    /// A dispatch-time precondition failed; the step waits for a re-plan.
    pub fn mark_blocked(&mut self, id: StepId) {
        if let Some(step) = self.step_mut(id) {
            step.state = StepState::Blocked;
        }
    }

    /// Returns blocked steps to the pending pool after a re-plan.
    pub fn release_blocked(&mut self) {
        for step in &mut self.steps {
            if step.state == StepState::Blocked {
                step.state = StepState::Pending;
            }
        }
    }

    pub fn mark_cancelled(&mut self, id: StepId, now: DateTime<Utc>) {
        if let Some(step) = self.step_mut(id) {
            step.state = StepState::Cancelled;
            step.finished = Some(now);
        }
        self.refresh_process_state(id);
    }

    /// Records a failed step and fails its owning process.
    pub fn on_failure(&mut self, id: StepId, cause: &str, now: DateTime<Utc>) {
        let process_id = {
            let Some(step) = self.step_mut(id) else {
                return;
            };
            step.state = StepState::Failed;
            step.finished = Some(now);
            step.process
        };
        let fct = self
            .step(id)
            .map(|s| s.op.fct.clone())
            .unwrap_or_default();
        self.fail_process(process_id, &format!("step {} ({}) failed: {}", id, fct, cause));
    }

    /// Records a successful step, resolves values and branches downstream.
    pub fn on_complete(
        &mut self,
        id: StepId,
        value: Option<ParamValue>,
        now: DateTime<Utc>,
    ) -> CompletionEffects {
        let mut effects = CompletionEffects::default();
        let (process_id, node) = {
            let Some(step) = self.step_mut(id) else {
                return effects;
            };
            step.state = StepState::Completed;
            step.finished = Some(now);
            (step.process, step.node)
        };

        // Feed the produced value into directly connected variables.
        let mut pruned: Vec<StepId> = Vec::new();
        if let Some(process) = self.processes.get_mut(&process_id) {
            if let Some(value) = &value {
                for edge in process.graph.outgoing(node) {
                    if matches!(process.graph.node(edge.to), Node::Variable { .. }) {
                        process.raw_values.insert(edge.to, value.clone());
                        if let Some(number) = value.as_f64() {
                            process.values.insert(edge.to, number);
                        }
                    }
                }
            }

            // Propagate through computations, then resolve ripe branches.
            let topo = process.graph.topo_order();
            for node_id in &topo {
                match process.graph.node(*node_id) {
                    Node::Computation { expr, .. } => {
                        if process.values.contains_key(node_id) {
                            continue;
                        }
                        let values = &process.values;
                        if let Some(result) = expr.eval(&|n| values.get(&n).copied()) {
                            process.values.insert(*node_id, result);
                            process
                                .raw_values
                                .insert(*node_id, ParamValue::Float(result));
                        }
                    }
                    Node::Branch { predicate, name } => {
                        if process.branch_arms.contains_key(node_id) {
                            continue;
                        }
                        let values = &process.values;
                        if let Some(arm) = predicate.eval(&|n| values.get(&n).copied()) {
                            process.branch_arms.insert(*node_id, arm);
                            debug!(
                                process = %process_id,
                                branch = %name,
                                arm,
                                "branch resolved"
                            );
                            effects
                                .resolved_branches
                                .push((process_id, *node_id, arm));
                            // Prune the losing arm.
                            for member in process.graph.arm_exclusive(*node_id, !arm) {
                                if let Some(step_id) = process.steps.get(&member) {
                                    pruned.push(*step_id);
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        for step_id in pruned {
            if let Some(step) = self.step_mut(step_id) {
                if !step.state.is_terminal() && step.state != StepState::Running {
                    step.state = StepState::Pruned;
                    effects.pruned_steps.push(step_id);
                }
            }
        }

        effects.finished_process = self.refresh_process_state(id);
        effects
    }

    /// Re-derives the owning process's terminal state after a step change.
    fn refresh_process_state(&mut self, step: StepId) -> Option<(ProcessId, ProcessState)> {
        let process_id = self.step(step)?.process;
        let process = self.processes.get(&process_id)?;
        if process.state.is_terminal() {
            return None;
        }
        let steps: Vec<&StepEntry> = self
            .steps
            .iter()
            .filter(|s| s.process == process_id)
            .collect();
        if steps.iter().any(|s| !s.state.is_terminal()) {
            return None;
        }
        let all_ok = steps
            .iter()
            .all(|s| matches!(s.state, StepState::Completed | StepState::Pruned));
        let new_state = if all_ok {
            ProcessState::Completed
        } else if steps.iter().any(|s| s.state == StepState::Failed) {
            ProcessState::Failed
        } else {
            ProcessState::Cancelled
        };
        let process = self.processes.get_mut(&process_id)?;
        process.state = new_state;
        info!(process = %process_id, state = ?new_state, "process finished");
        Some((process_id, new_state))
    }

    /// Resolved raw value of a process-local node, if any.
    pub fn resolved_value(&self, process: ProcessId, node: NodeId) -> Option<&ParamValue> {
        self.processes.get(&process)?.raw_values.get(&node)
    }

    /// Container bound to a graph-local name within a process.
    pub fn process_container(&self, process: ProcessId, name: &str) -> Option<ContainerId> {
        self.processes.get(&process)?.containers.get(name).copied()
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    /// Freezes the plannable part of the instance for the scheduler worker.
    pub fn snapshot(
        &self,
        store: &StatusStore,
        estimator: &DurationEstimator,
        now: DateTime<Utc>,
    ) -> InstanceSnapshot {
        let devices = store
            .devices()
            .iter()
            .map(|d| SnapshotDevice {
                id: d.id,
                name: d.name.clone(),
                kind: d.kind,
                capacity: d.capacity,
                process_capacity: d.process_capacity,
                min_capacity: d.min_capacity,
                allows_overlap: d.allows_overlap,
            })
            .collect();

        let container_device: HashMap<ContainerId, DeviceId> = store
            .containers()
            .map(|c| (c.id, c.current_pos.device))
            .collect();

        let mut fixed_finish: HashMap<StepId, DateTime<Utc>> = HashMap::new();
        let mut running = Vec::new();
        let mut steps = Vec::new();
        for step in &self.steps {
            let Some(process) = self.processes.get(&step.process) else {
                continue;
            };
            match step.state {
                StepState::Completed => {
                    if let Some(finished) = step.finished {
                        fixed_finish.insert(step.id, finished);
                    }
                }
                StepState::Pruned | StepState::Cancelled | StepState::Failed => {
                    // Terminal without a finish that constrains successors.
                    let at = step.finished.unwrap_or(now);
                    fixed_finish.insert(step.id, at);
                }
                StepState::Running => {
                    let duration = self.planning_duration(step, store, estimator);
                    let started = step.started.unwrap_or(now);
                    let expected_finish =
                        started + TimeDelta::from_std(duration).unwrap_or_default();
                    fixed_finish.insert(step.id, expected_finish.max(now));
                    let device = step.running_on.or_else(|| {
                        step.containers
                            .first()
                            .and_then(|c| container_device.get(c).copied())
                    });
                    running.push(RunningStep {
                        id: step.id,
                        device: device.unwrap_or(DeviceId(0)),
                        started,
                        expected_finish: expected_finish.max(now),
                        containers: step.containers.clone(),
                        is_movement: step.op.is_movement,
                    });
                }
                StepState::Pending | StepState::Ready | StepState::Blocked => {
                    if !matches!(process.state, ProcessState::Running | ProcessState::Paused) {
                        continue;
                    }
                    let duration = self.planning_duration(step, store, estimator);
                    let earliest_allowed = process.started_at.unwrap_or(now).max(now);
                    steps.push(SnapshotStep {
                        id: step.id,
                        process: step.process,
                        priority: process.priority,
                        fct: step.op.fct.clone(),
                        kind: step.op.device_kind,
                        duration,
                        containers: step.containers.clone(),
                        deps: step
                            .preds
                            .iter()
                            .filter(|(pred, _)| {
                                // Pruned predecessors no longer constrain.
                                self.step(*pred)
                                    .map(|p| p.state != StepState::Pruned)
                                    .unwrap_or(false)
                            })
                            .map(|(pred, constraint)| SnapshotDep {
                                pred: *pred,
                                min: constraint.min,
                                max: constraint.max,
                                cost: constraint.cost,
                            })
                            .collect(),
                        is_movement: step.op.is_movement,
                        batch_key: format!(
                            "{}|{}|{}",
                            step.op.fct,
                            step.op.device_kind,
                            canonical_params(&step.op.params)
                        ),
                        earliest_allowed,
                        wait_cost_sum: step.preds.iter().map(|(_, c)| c.cost).sum(),
                    });
                }
            }
        }

        InstanceSnapshot {
            taken_at: now,
            devices,
            steps,
            running,
            fixed_finish,
            container_device,
        }
    }

    /// Estimator-backed duration with fallback to the declared one.
    fn planning_duration(
        &self,
        step: &StepEntry,
        store: &StatusStore,
        estimator: &DurationEstimator,
    ) -> Duration {
        let estimated = if step.op.is_movement {
            step.containers
                .first()
                .and_then(|c| store.container(*c))
                .and_then(|c| store.device(c.current_pos.device))
                .map(|d| d.kind)
                .and_then(|source| {
                    store.estimate_duration(
                        estimator,
                        &EstimateKey::Movement {
                            source,
                            target: step.op.device_kind,
                        },
                    )
                })
        } else {
            store
                .estimate_duration(
                    estimator,
                    &EstimateKey::Call {
                        fct: &step.op.fct,
                        params: &step.op.params,
                    },
                )
                .or_else(|| {
                    store.estimate_duration(estimator, &EstimateKey::Fct { fct: &step.op.fct })
                })
        };
        estimated.unwrap_or(step.op.expected_duration)
    }
}
