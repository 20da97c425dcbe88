//! Executor: drives the plan against device adapters.
//!
//! The executor owns the in-flight table. It dispatches plan steps whose
//! start time has arrived and whose preconditions hold, forwards adapter
//! observations into the core loop as messages, and watches running steps
//! for deviation (overrun beyond slack triggers a short re-plan) and for
//! timeout (overrun beyond the timeout factor cancels and fails the step).
//!
//! Commits happen in the core loop, not here: the executor reports, the
//! orchestrator owns the store and the instance and applies state changes.

use crate::adapters::{AdapterRegistry, Observation, OperationHandle, StepDispatch};
use crate::config::ExecutorConfig;
use crate::core::{DeviceId, StepId};
use crate::instance::SchedulingInstance;
use crate::sched::Plan;
use crate::store::StatusStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Message from an adapter task back into the core loop.
#[derive(Debug)]
pub enum ExecEvent {
    Observation {
        step: StepId,
        observation: Observation,
    },
    /// The adapter's stream ended without a terminal status.
    StreamLost { step: StepId },
}

/// Bookkeeping for one running operation.
pub struct InFlight {
    pub step: StepId,
    pub device: DeviceId,
    pub started: DateTime<Utc>,
    pub scheduled: Duration,
    handle: Box<dyn OperationHandle>,
    forwarder: JoinHandle<()>,
    pub deviation_flagged: bool,
    pub cancel_requested: bool,
    pub timed_out: bool,
}

/// Outcome of one dispatch sweep.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub dispatched: Vec<StepId>,
    /// Steps whose dispatch-time precondition failed; a short re-plan is due.
    pub blocked: Vec<StepId>,
}

/// What the watchdog found on a sweep.
#[derive(Debug, Default)]
pub struct WatchReport {
    /// A running step has overrun its slack; the plan is stale.
    pub deviation: bool,
    /// Steps past their timeout; cancel and fail them.
    pub timeouts: Vec<StepId>,
}

pub struct Executor {
    registry: AdapterRegistry,
    /// Replaces the registry while simulation is active.
    sim_registry: Option<AdapterRegistry>,
    sim_speed: f64,
    in_flight: HashMap<StepId, InFlight>,
    paused: bool,
    config: ExecutorConfig,
    event_tx: mpsc::Sender<ExecEvent>,
}

impl Executor {
    pub fn new(
        registry: AdapterRegistry,
        config: ExecutorConfig,
        event_tx: mpsc::Sender<ExecEvent>,
    ) -> Self {
        Self {
            registry,
            sim_registry: None,
            sim_speed: 1.0,
            in_flight: HashMap::new(),
            paused: false,
            config,
            event_tx,
        }
    }

    pub fn enable_simulation(&mut self, speed: f64) {
        self.sim_speed = if speed > 0.0 { speed } else { 1.0 };
        self.sim_registry = Some(AdapterRegistry::simulated(self.sim_speed));
        debug!(speed = self.sim_speed, "simulation enabled");
    }

    pub fn disable_simulation(&mut self) {
        self.sim_registry = None;
        debug!("simulation disabled");
    }

    pub fn simulation_active(&self) -> bool {
        self.sim_registry.is_some()
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn in_flight(&self, step: StepId) -> Option<&InFlight> {
        self.in_flight.get(&step)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Removes the bookkeeping for a step that reached a terminal status.
    pub fn finish(&mut self, step: StepId) -> Option<InFlight> {
        let entry = self.in_flight.remove(&step)?;
        entry.forwarder.abort();
        Some(entry)
    }

    /// Cooperatively cancels an in-flight step; `true` when honoured.
    pub async fn cancel_step(&mut self, step: StepId) -> bool {
        let Some(entry) = self.in_flight.get_mut(&step) else {
            return false;
        };
        entry.cancel_requested = true;
        let honoured = entry.handle.cancel().await;
        debug!(step = %step, honoured, "cancel signalled");
        honoured
    }

    /// Flags a step as timed out before cancelling it.
    pub fn flag_timeout(&mut self, step: StepId) {
        if let Some(entry) = self.in_flight.get_mut(&step) {
            entry.timed_out = true;
        }
    }

    /// Dispatches every plan step whose time has come.
    pub async fn dispatch(
        &mut self,
        plan: &Plan,
        instance: &mut SchedulingInstance,
        store: &StatusStore,
        now: DateTime<Utc>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        if self.paused {
            return report;
        }
        for step_id in instance.ready_steps(store, now) {
            let Some(assignment) = plan.assignment(step_id) else {
                // Not planned yet; the next plan will cover it.
                continue;
            };
            if assignment.earliest_start > now {
                instance.mark_ready(step_id);
                continue;
            }
            let (op, containers) = match instance.step(step_id) {
                Some(step) => (step.op.clone(), step.containers.clone()),
                None => continue,
            };
            let Some(device) = store.device(assignment.device) else {
                continue;
            };
            let device_id = device.id;
            let device_name = device.name.clone();

            // Dispatch-time preconditions beyond graph readiness.
            let precondition_ok = if op.is_movement {
                let deep_well = containers
                    .iter()
                    .filter_map(|c| store.container(*c))
                    .any(|c| c.deep_well);
                store.free_slot(device_id, deep_well).is_some()
            } else {
                containers.iter().all(|c| {
                    store
                        .container(*c)
                        .map(|c| c.current_pos.device == device_id)
                        .unwrap_or(false)
                })
            };
            if !precondition_ok {
                warn!(step = %step_id, device = %device_name, "precondition failed; step blocked");
                instance.mark_blocked(step_id);
                report.blocked.push(step_id);
                continue;
            }

            let registry = self.sim_registry.as_ref().unwrap_or(&self.registry);
            let Some(adapter) = registry.adapter_for(op.device_kind) else {
                warn!(step = %step_id, kind = %op.device_kind, "no adapter registered");
                instance.mark_blocked(step_id);
                report.blocked.push(step_id);
                continue;
            };

            let dispatch = StepDispatch {
                step: step_id,
                fct: op.fct.clone(),
                device: device_name.clone(),
                device_kind: op.device_kind,
                containers: containers.clone(),
                params: op.params.clone(),
                scheduled_duration: assignment.duration,
                is_movement: op.is_movement,
            };
            let mut handle = match adapter.submit(dispatch).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(step = %step_id, error = %e, "adapter rejected dispatch");
                    let _ = self
                        .event_tx
                        .send(ExecEvent::Observation {
                            step: step_id,
                            observation: Observation::failed(format!("transport: {}", e)),
                        })
                        .await;
                    continue;
                }
            };

            let forwarder = match handle.observations() {
                Some(mut rx) => {
                    let tx = self.event_tx.clone();
                    tokio::spawn(async move {
                        let mut terminal_seen = false;
                        while let Some(observation) = rx.recv().await {
                            terminal_seen = observation.status.is_terminal();
                            let _ = tx
                                .send(ExecEvent::Observation {
                                    step: step_id,
                                    observation,
                                })
                                .await;
                        }
                        if !terminal_seen {
                            let _ = tx.send(ExecEvent::StreamLost { step: step_id }).await;
                        }
                    })
                }
                None => {
                    let tx = self.event_tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(ExecEvent::StreamLost { step: step_id }).await;
                    })
                }
            };

            debug!(
                step = %step_id,
                fct = %op.fct,
                device = %device_name,
                "step dispatched"
            );
            instance.mark_running(step_id, device_id, now);
            self.in_flight.insert(
                step_id,
                InFlight {
                    step: step_id,
                    device: device_id,
                    started: now,
                    scheduled: assignment.duration,
                    handle,
                    forwarder,
                    deviation_flagged: false,
                    cancel_requested: false,
                    timed_out: false,
                },
            );
            report.dispatched.push(step_id);
        }
        report
    }

    /// Scans running steps for deviation and timeout.
    pub fn watchdog(&mut self, now: DateTime<Utc>) -> WatchReport {
        let mut report = WatchReport::default();
        // Simulated time runs faster; scale the expectations accordingly.
        let scale = if self.sim_registry.is_some() {
            self.sim_speed
        } else {
            1.0
        };
        for entry in self.in_flight.values_mut() {
            let elapsed = (now - entry.started).to_std().unwrap_or_default();
            let scheduled = entry.scheduled.as_secs_f64() / scale;
            let slack = self.config.deviation_slack_secs / scale;
            if !entry.deviation_flagged && elapsed.as_secs_f64() > scheduled + slack {
                warn!(
                    step = %entry.step,
                    elapsed = elapsed.as_secs_f64(),
                    scheduled,
                    "step overran its slack"
                );
                entry.deviation_flagged = true;
                report.deviation = true;
            }
            let mut timeout = scheduled * self.config.timeout_factor + slack;
            if entry.cancel_requested {
                // A signalled adapter gets the grace period on top.
                timeout += self.config.cancel_grace_secs / scale;
            }
            if !entry.timed_out && elapsed.as_secs_f64() > timeout {
                warn!(step = %entry.step, "step exceeded its timeout");
                report.timeouts.push(entry.step);
            }
        }
        report
    }
}
