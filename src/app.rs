//! Orchestrator core loop.
//!
//! One task owns all mutable state: the status store, the scheduling
//! instance and the live plan. Everything else talks to it by message:
//! control commands from [`LabHandle`](crate::messages::LabHandle), adapter
//! observations from the executor's forwarder tasks, and finished plans
//! from the scheduler worker. The loop never blocks on device I/O; it
//! blocks only on its inboxes and a watchdog tick.
//!
//! Re-planning policy: a long plan on `start` and on scheduler reset, a
//! short plan after every commit, deviation, blocked dispatch or
//! cancellation. Scheduler infeasibility keeps the previous feasible plan
//! running and fails the affected processes only after the configured
//! deadline has passed without relief.

use crate::adapters::{AdapterRegistry, Observation, OpStatus};
use crate::config::LabConfig;
use crate::core::{ContainerId, DeviceId, ParamValue, Position, ProcessId, StepId};
use crate::error::{LabResult, StateConflict};
use crate::estimator::{DurationEstimator, EstimateKey};
use crate::exec::{ExecEvent, Executor};
use crate::graph::builder::ProcessParser;
use crate::graph::OperationNode;
use crate::instance::{ProcessState, SchedulingInstance, StepState};
use crate::messages::{LabCommand, LabHandle, ProcessReport, Scope, StatusReport, StepReport};
use crate::sched::{self, Plan, PlanMode, SchedError};
use crate::store::history::{HistoryRecord, MovementRecord, StepStatus};
use crate::store::persistence::{JournalEvent, ProcessRow};
use crate::store::StatusStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Result of one scheduler worker invocation.
struct SchedOutcome {
    result: Result<Plan, SchedError>,
    mode: PlanMode,
}

pub struct Orchestrator {
    config: LabConfig,
    store: StatusStore,
    instance: SchedulingInstance,
    estimator: DurationEstimator,
    executor: Executor,
    parser: Arc<dyn ProcessParser>,
    plan: Plan,
    plan_stale: bool,
    scheduling: bool,
    /// Upgrade the next kicked plan to long mode.
    want_long_plan: bool,
    /// First time each process was reported unschedulable.
    unschedulable_since: HashMap<ProcessId, DateTime<Utc>>,
    sched_tx: mpsc::Sender<SchedOutcome>,
}

impl Orchestrator {
    /// Builds the orchestrator and spawns its core loop.
    pub fn spawn(
        config: LabConfig,
        store: StatusStore,
        registry: AdapterRegistry,
        parser: Arc<dyn ProcessParser>,
    ) -> (LabHandle, JoinHandle<LabResult<()>>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (exec_tx, exec_rx) = mpsc::channel(256);
        let (sched_tx, sched_rx) = mpsc::channel(4);

        let mut executor = Executor::new(registry, config.executor.clone(), exec_tx);
        if config.simulation.enabled {
            executor.enable_simulation(config.simulation.speed);
        }
        let estimator = DurationEstimator::new(&config.estimator);
        let now = Utc::now();
        let orchestrator = Orchestrator {
            config,
            store,
            instance: SchedulingInstance::new(),
            estimator,
            executor,
            parser,
            plan: Plan::empty(now, PlanMode::Long),
            plan_stale: false,
            scheduling: false,
            want_long_plan: false,
            unschedulable_since: HashMap::new(),
            sched_tx,
        };
        let task = tokio::spawn(orchestrator.run(command_rx, exec_rx, sched_rx));
        (LabHandle::new(command_tx), task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<LabCommand>,
        mut exec_rx: mpsc::Receiver<ExecEvent>,
        mut sched_rx: mpsc::Receiver<SchedOutcome>,
    ) -> LabResult<()> {
        info!(devices = self.store.devices().len(), "orchestrator started");
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.executor.poll_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = commands.recv() => match maybe {
                    Some(LabCommand::Shutdown { response }) => {
                        info!("shutdown requested");
                        let _ = response.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = exec_rx.recv() => self.handle_exec_event(event).await,
                Some(outcome) = sched_rx.recv() => self.handle_plan(outcome),
                _ = tick.tick() => {}
            }
            self.pump(Utc::now()).await;
        }
        info!("orchestrator stopped");
        Ok(())
    }

    /// One turn of the crank: watchdog, re-plan kick, dispatch.
    async fn pump(&mut self, now: DateTime<Utc>) {
        let watch = self.executor.watchdog(now);
        if watch.deviation {
            self.plan_stale = true;
        }
        for step in watch.timeouts {
            self.executor.flag_timeout(step);
            let honoured = self.executor.cancel_step(step).await;
            if !honoured {
                self.fail_step(step, "timeout", now);
            }
            self.plan_stale = true;
        }

        if self.plan_stale && !self.scheduling && self.instance.has_live_work() {
            let mode = if self.want_long_plan {
                PlanMode::Long
            } else {
                PlanMode::Short
            };
            self.want_long_plan = false;
            self.start_planning(mode, now);
        }

        let report = self
            .executor
            .dispatch(&self.plan, &mut self.instance, &self.store, now)
            .await;
        if !report.blocked.is_empty() {
            self.plan_stale = true;
        }
    }

    fn start_planning(&mut self, mode: PlanMode, now: DateTime<Utc>) {
        self.scheduling = true;
        self.plan_stale = false;
        let snapshot = self.instance.snapshot(&self.store, &self.estimator, now);
        let budget = Duration::from_millis(match mode {
            PlanMode::Short => self.config.scheduler.short_budget_ms,
            PlanMode::Long => self.config.scheduler.long_budget_ms,
        });
        let previous = self.plan.clone();
        let tx = self.sched_tx.clone();
        debug!(?mode, steps = snapshot.steps.len(), "planning started");
        tokio::task::spawn_blocking(move || {
            let result = sched::schedule(&snapshot, now, budget, mode, Some(&previous));
            let _ = tx.blocking_send(SchedOutcome { result, mode });
        });
    }

    fn handle_plan(&mut self, outcome: SchedOutcome) {
        self.scheduling = false;
        match outcome.result {
            Ok(plan) => {
                debug!(
                    steps = plan.len(),
                    objective = plan.objective,
                    mode = ?outcome.mode,
                    "plan adopted"
                );
                self.plan = plan;
                self.instance.release_blocked();
                // Feasible again: clear standing unschedulable marks for
                // processes the plan now covers.
                let plan = &self.plan;
                let instance = &self.instance;
                self.unschedulable_since.retain(|process, _| {
                    !instance
                        .steps_of(*process)
                        .iter()
                        .all(|s| s.state.is_terminal() || plan.assignment(s.id).is_some())
                });
            }
            Err(SchedError::Infeasible {
                reason,
                unschedulable,
                previous,
            }) => {
                warn!(reason = %reason, affected = unschedulable.len(), "plan infeasible");
                if let Some(previous) = previous {
                    // Keep executing what was already feasible.
                    self.plan = *previous;
                }
                let now = Utc::now();
                let deadline = self.config.executor.unschedulable_deadline_secs;
                for process in unschedulable {
                    let since = *self.unschedulable_since.entry(process).or_insert(now);
                    let waited = (now - since).to_std().unwrap_or_default().as_secs_f64();
                    if waited >= deadline {
                        self.instance.fail_process(
                            process,
                            &format!("unschedulable for {:.0}s: {}", waited, reason),
                        );
                        self.persist_process_state(process);
                        self.unschedulable_since.remove(&process);
                    }
                }
                // Constraints may relax (new submissions, completions), so
                // keep trying until the deadline passes.
                self.plan_stale = true;
            }
        }
    }

    // ------------------------------------------------------------------
    // Adapter events
    // ------------------------------------------------------------------

    async fn handle_exec_event(&mut self, event: ExecEvent) {
        let now = Utc::now();
        match event {
            ExecEvent::Observation { step, observation } => match observation.status {
                OpStatus::Started | OpStatus::Running => {
                    trace!(step = %step, progress = observation.progress, "progress");
                }
                OpStatus::Ok => self.commit_ok(step, observation, now),
                OpStatus::Failed => {
                    let cause = observation
                        .error
                        .unwrap_or_else(|| "device reported failure".into());
                    self.fail_step(step, &cause, now);
                }
                OpStatus::Timeout => self.fail_step(step, "timeout", now),
                OpStatus::Cancelled => self.settle_cancelled(step, now),
            },
            ExecEvent::StreamLost { step } => {
                // Lost adapter connection: a step failure with a transport
                // cause, contained to the owning workflow.
                if self
                    .instance
                    .step(step)
                    .map(|s| s.state == StepState::Running)
                    .unwrap_or(false)
                {
                    self.fail_step(step, "transport: observation stream lost", now);
                }
            }
        }
    }

    /// Commits a successful step: physical effects, history, value feed.
    fn commit_ok(&mut self, step_id: StepId, observation: Observation, now: DateTime<Utc>) {
        let in_flight = self.executor.finish(step_id);
        let Some(step) = self.instance.step(step_id) else {
            return;
        };
        // A step already written off (timeout, cancellation) can still
        // complete physically; the container state must follow the facts,
        // but its value no longer feeds the workflow.
        let was_running = step.state == StepState::Running;
        if !was_running {
            debug!(step = %step_id, state = ?step.state, "late completion");
        }
        let op = step.op.clone();
        let containers = step.containers.clone();
        let process = step.process;
        let started = in_flight
            .as_ref()
            .map(|f| f.started)
            .or(step.started)
            .unwrap_or(now);
        let device = in_flight
            .as_ref()
            .map(|f| f.device)
            .or(step.running_on)
            .unwrap_or(DeviceId(0));
        let experiment = self
            .instance
            .process_experiment(process)
            .unwrap_or_else(Uuid::new_v4);

        let mut movement = None;
        let mut commit_error: Option<StateConflict> = None;
        if op.is_movement {
            for container in &containers {
                match self.commit_move(*container, &op, device) {
                    Ok(record) => movement = Some(record),
                    Err(conflict) => {
                        commit_error = Some(conflict);
                        break;
                    }
                }
            }
        } else if op.fct == "unlid" || op.fct == "lid" {
            if let Err(conflict) = self.commit_lid_op(&op, &containers) {
                commit_error = Some(conflict);
            }
        }

        let device_name = self.store.device_name(device).to_string();
        let device_kind = self
            .store
            .device(device)
            .map(|d| d.kind)
            .unwrap_or(op.device_kind);

        if let Some(conflict) = commit_error {
            error!(step = %step_id, error = %conflict, "commit rejected by status store");
            self.store.record_step(HistoryRecord {
                experiment,
                step_name: op.fct.clone(),
                device: device_name,
                device_kind,
                containers,
                started,
                finished: now,
                status: StepStatus::Failed,
                value: None,
                params: op.params.clone(),
                movement: None,
                is_simulation: self.executor.simulation_active(),
            });
            self.fail_step_inner(step_id, &format!("commit rejected: {}", conflict), now);
            return;
        }

        self.store.record_step(HistoryRecord {
            experiment,
            step_name: op.fct.clone(),
            device: device_name,
            device_kind,
            containers,
            started,
            finished: now,
            status: StepStatus::Ok,
            value: observation.value.clone(),
            params: op.params.clone(),
            movement,
            is_simulation: self.executor.simulation_active(),
        });

        if was_running {
            let effects = self.instance.on_complete(step_id, observation.value, now);
            for (process, branch, arm) in &effects.resolved_branches {
                debug!(process = %process, branch = %branch, arm, "branch resolved; losing arm pruned");
            }
            if let Some((process, state)) = effects.finished_process {
                self.on_process_finished(process, state);
            }
        }
        self.plan_stale = true;
    }

    /// Applies the physical move of one container, including lid handling.
    fn commit_move(
        &mut self,
        container: ContainerId,
        op: &OperationNode,
        destination: DeviceId,
    ) -> Result<MovementRecord, StateConflict> {
        let current = self
            .store
            .container(container)
            .ok_or(StateConflict::UnknownContainer(container))?;
        let src = current.current_pos;
        let was_lidded = current.lidded;
        let lid_pos = current.lid_pos;
        let deep_well = current.deep_well;
        let source_kind = self
            .store
            .device(src.device)
            .map(|d| d.kind)
            .ok_or_else(|| StateConflict::UnknownDevice(src.device.to_string()))?;
        let target_kind = self
            .store
            .device(destination)
            .map(|d| d.kind)
            .ok_or_else(|| StateConflict::UnknownDevice(destination.to_string()))?;

        let travel_lidded = op
            .params
            .get("lidded")
            .and_then(|v| v.as_bool())
            .unwrap_or(was_lidded);

        // Park position for a lid coming off; defaults to the slot the
        // container is about to vacate.
        let park = match (
            op.params.get("park_device").and_then(|v| v.as_str()),
            op.params.get("park_slot").and_then(|v| v.as_i64()),
        ) {
            (Some(device), Some(slot)) => {
                let device = self
                    .store
                    .device_by_name(device)
                    .ok_or_else(|| StateConflict::UnknownDevice(device.to_string()))?;
                Position::new(device.id, slot as u32)
            }
            _ => src,
        };
        if !travel_lidded && was_lidded && park != src && !self.store.position_empty(park) {
            return Err(StateConflict::PositionOccupied(park));
        }

        // Picking the lid back up frees its slot before the move lands.
        if travel_lidded && !was_lidded {
            self.store.lid(container, lid_pos)?;
        }

        let slot = match op.params.get("dst_slot").and_then(|v| v.as_i64()) {
            Some(slot) => slot as u32,
            None => self
                .store
                .free_slot(destination, deep_well)
                .ok_or_else(|| {
                    StateConflict::DeviceFull(self.store.device_name(destination).to_string())
                })?,
        };
        let dst = Position::new(destination, slot);
        self.store.move_container(src, dst, None)?;

        let mut parked_at = None;
        if !travel_lidded && was_lidded {
            self.store.unlid(container, park)?;
            parked_at = Some(park);
        }

        Ok(MovementRecord {
            origin: src,
            destination: dst,
            source_kind,
            target_kind,
            lidded: travel_lidded,
            lid_parked_at: if travel_lidded {
                None
            } else {
                parked_at.or(lid_pos)
            },
        })
    }

    /// Commits a standalone lid operation (`lid` / `unlid` functions).
    fn commit_lid_op(
        &mut self,
        op: &OperationNode,
        containers: &[ContainerId],
    ) -> Result<(), StateConflict> {
        let coords = match (
            op.params.get("lid_device").and_then(|v| v.as_str()),
            op.params.get("lid_slot").and_then(|v| v.as_i64()),
        ) {
            (Some(device), Some(slot)) => {
                let device = self
                    .store
                    .device_by_name(device)
                    .ok_or_else(|| StateConflict::UnknownDevice(device.to_string()))?;
                Some(Position::new(device.id, slot as u32))
            }
            _ => None,
        };
        for container in containers {
            if op.fct == "unlid" {
                let park = coords.ok_or(StateConflict::NotLidded(*container))?;
                self.store.unlid(*container, park)?;
            } else {
                self.store.lid(*container, coords)?;
            }
        }
        Ok(())
    }

    fn fail_step(&mut self, step_id: StepId, cause: &str, now: DateTime<Utc>) {
        if let Some(in_flight) = self.executor.finish(step_id) {
            let device_name = self.store.device_name(in_flight.device).to_string();
            if let Some(step) = self.instance.step(step_id) {
                let experiment = self
                    .instance
                    .process_experiment(step.process)
                    .unwrap_or_else(Uuid::new_v4);
                self.store.record_step(HistoryRecord {
                    experiment,
                    step_name: step.op.fct.clone(),
                    device: device_name,
                    device_kind: step.op.device_kind,
                    containers: step.containers.clone(),
                    started: in_flight.started,
                    finished: now,
                    status: StepStatus::Failed,
                    value: None,
                    params: step.op.params.clone(),
                    movement: None,
                    is_simulation: self.executor.simulation_active(),
                });
            }
        }
        self.fail_step_inner(step_id, cause, now);
    }

    fn fail_step_inner(&mut self, step_id: StepId, cause: &str, now: DateTime<Utc>) {
        let process = self.instance.step(step_id).map(|s| s.process);
        self.instance.on_failure(step_id, cause, now);
        if let Some(process) = process {
            self.persist_process_state(process);
        }
        self.plan_stale = true;
    }

    /// A cancelled observation: no commit, terminal state only.
    fn settle_cancelled(&mut self, step_id: StepId, now: DateTime<Utc>) {
        let timed_out = self
            .executor
            .in_flight(step_id)
            .map(|f| f.timed_out)
            .unwrap_or(false);
        let _ = self.executor.finish(step_id);
        if timed_out {
            self.fail_step_inner(step_id, "timeout", now);
            return;
        }
        if let Some(step) = self.instance.step(step_id) {
            let experiment = self
                .instance
                .process_experiment(step.process)
                .unwrap_or_else(Uuid::new_v4);
            let device = step
                .running_on
                .map(|d| self.store.device_name(d).to_string())
                .unwrap_or_default();
            self.store.record_step(HistoryRecord {
                experiment,
                step_name: step.op.fct.clone(),
                device,
                device_kind: step.op.device_kind,
                containers: step.containers.clone(),
                started: step.started.unwrap_or(now),
                finished: now,
                status: StepStatus::Cancelled,
                value: None,
                params: step.op.params.clone(),
                movement: None,
                is_simulation: self.executor.simulation_active(),
            });
        }
        let process = self.instance.step(step_id).map(|s| s.process);
        self.instance.mark_cancelled(step_id, now);
        if let Some(process) = process {
            self.persist_process_state(process);
        }
        self.plan_stale = true;
    }

    fn on_process_finished(&mut self, process: ProcessId, state: ProcessState) {
        info!(process = %process, ?state, "workflow finished");
        self.persist_process_state(process);
    }

    fn persist_process_state(&mut self, process: ProcessId) {
        let Some(state) = self.instance.process_state(process) else {
            return;
        };
        if let (Some(journal), Some(name), Some(experiment)) = (
            self.store.journal(),
            self.instance.process_name(process),
            self.instance.process_experiment(process),
        ) {
            journal.record(JournalEvent::Process(ProcessRow {
                id: process,
                name: name.to_string(),
                state: format!("{:?}", state).to_lowercase(),
                experiment,
            }));
        }
    }

    // ------------------------------------------------------------------
    // Control commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: LabCommand) {
        match command {
            LabCommand::SubmitProcess {
                source,
                name,
                delay_minutes,
                priority,
                response,
            } => {
                let result = self.submit_process(&source, &name, delay_minutes, priority);
                let _ = response.send(result);
            }
            LabCommand::Start {
                processes,
                response,
            } => {
                let now = Utc::now();
                let result = self.instance.start(&processes, now);
                if result.is_ok() {
                    // Initial planning for fresh workflows is a full plan.
                    self.plan_stale = true;
                    self.want_long_plan = true;
                }
                let _ = response.send(result);
            }
            LabCommand::Pause { scope, response } => {
                let result = match scope {
                    Scope::All => {
                        self.executor.pause();
                        Ok(())
                    }
                    Scope::Process(id) => self.instance.pause(id),
                };
                let _ = response.send(result);
            }
            LabCommand::Resume { scope, response } => {
                let result = match scope {
                    Scope::All => {
                        self.executor.resume();
                        Ok(())
                    }
                    Scope::Process(id) => self.instance.resume(id),
                };
                if result.is_ok() {
                    self.plan_stale = true;
                }
                let _ = response.send(result);
            }
            LabCommand::Cancel { scope, response } => {
                let result = self.cancel_scope(scope).await;
                let _ = response.send(result);
            }
            LabCommand::EnableSimulation { speed, response } => {
                self.executor.enable_simulation(speed);
                let _ = response.send(());
            }
            LabCommand::DisableSimulation { response } => {
                self.executor.disable_simulation();
                let _ = response.send(());
            }
            LabCommand::QueryStatus { process, response } => {
                let _ = response.send(Ok(self.status_report(process)));
            }
            LabCommand::ConfigureLab { document, response } => {
                let result = self.configure_lab(&document);
                let _ = response.send(result);
            }
            LabCommand::Shutdown { response } => {
                // Handled in the loop; kept for completeness.
                let _ = response.send(());
            }
        }
    }

    fn submit_process(
        &mut self,
        source: &str,
        name: &str,
        delay_minutes: Option<u32>,
        priority: i32,
    ) -> LabResult<ProcessId> {
        let mut graph = self.parser.parse(source, name)?;
        // Stamp operations with learned durations before planning.
        let store = &self.store;
        let estimator = &self.estimator;
        graph.annotate_durations(|op| {
            if op.is_movement {
                return None;
            }
            store
                .estimate_duration(
                    estimator,
                    &EstimateKey::Call {
                        fct: &op.fct,
                        params: &op.params,
                    },
                )
                .or_else(|| store.estimate_duration(estimator, &EstimateKey::Fct { fct: &op.fct }))
        });
        let delay = Duration::from_secs(u64::from(delay_minutes.unwrap_or(0)) * 60);
        self.instance
            .submit(graph, priority, delay, &mut self.store)
    }

    async fn cancel_scope(&mut self, scope: Scope) -> LabResult<()> {
        let targets: Vec<ProcessId> = match scope {
            Scope::Process(id) => vec![id],
            Scope::All => self
                .instance
                .process_ids()
                .into_iter()
                .filter(|id| {
                    self.instance
                        .process_state(*id)
                        .map(|s| !s.is_terminal())
                        .unwrap_or(false)
                })
                .collect(),
        };
        for process in targets {
            let running = self.instance.cancel(process)?;
            for step in running {
                // Cooperative: an adapter that refuses keeps running and its
                // completion still commits; successors are already gone.
                self.executor.cancel_step(step).await;
            }
            self.persist_process_state(process);
        }
        self.plan_stale = true;
        Ok(())
    }

    fn configure_lab(&mut self, document: &str) -> LabResult<()> {
        let config = LabConfig::from_document(document)?;
        self.store.configure(&config.catalogue())?;
        self.plan_stale = true;
        self.want_long_plan = true;
        Ok(())
    }

    fn status_report(&self, filter: Option<ProcessId>) -> StatusReport {
        let mut processes = Vec::new();
        for id in self.instance.process_ids() {
            if filter.is_some_and(|f| f != id) {
                continue;
            }
            let Some(state) = self.instance.process_state(id) else {
                continue;
            };
            let steps: Vec<StepReport> = self
                .instance
                .steps_of(id)
                .iter()
                .map(|step| StepReport {
                    id: step.id,
                    fct: step.op.fct.clone(),
                    state: step.state,
                    eta: step.finished.or_else(|| self.plan.eta(step.id)),
                })
                .collect();
            let last_executed = self
                .instance
                .steps_of(id)
                .iter()
                .filter(|s| s.state == StepState::Completed)
                .max_by_key(|s| s.finished)
                .map(|s| s.op.fct.clone());
            let next_planned = self
                .instance
                .steps_of(id)
                .iter()
                .filter(|s| matches!(s.state, StepState::Pending | StepState::Ready))
                .filter_map(|s| {
                    self.plan
                        .assignment(s.id)
                        .map(|a| (s.op.fct.clone(), a.earliest_start))
                })
                .min_by_key(|(_, start)| *start);
            processes.push(ProcessReport {
                id,
                name: self
                    .instance
                    .process_name(id)
                    .unwrap_or_default()
                    .to_string(),
                state,
                error: self.instance.process_error(id).map(str::to_string),
                last_executed,
                next_planned,
                steps,
            });
        }
        StatusReport {
            processes,
            simulation_active: self.executor.simulation_active(),
            paused: self.executor.is_paused(),
        }
    }
}
