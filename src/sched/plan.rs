//! The plan: per-step device assignments and start-time windows.

use crate::core::{ContainerId, DeviceId, StepId};
use crate::instance::InstanceSnapshot;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

/// Planning mode, bounded by a short or long time budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanMode {
    /// Local re-plan on execution events; keeps unaffected assignments.
    Short,
    /// Full plan on submission or reset.
    Long,
}

/// Where and when one step runs.
#[derive(Clone, Debug)]
pub struct Assignment {
    pub step: StepId,
    pub device: DeviceId,
    pub earliest_start: DateTime<Utc>,
    /// Latest start still satisfying every `max_wait` window.
    pub latest_start: DateTime<Utc>,
    pub duration: Duration,
    /// Steps co-scheduled in the same device run (minimum-occupancy
    /// bundling); contains the step itself when non-empty.
    pub batch: Vec<StepId>,
}

impl Assignment {
    pub fn finish(&self) -> DateTime<Utc> {
        self.earliest_start + TimeDelta::from_std(self.duration).unwrap_or_default()
    }
}

/// Feasible start-time assignment for every plannable step.
#[derive(Clone, Debug)]
pub struct Plan {
    pub created_at: DateTime<Utc>,
    pub mode: PlanMode,
    assignments: HashMap<StepId, Assignment>,
    /// Totally ordered queue per device (by start, then id).
    device_queues: HashMap<DeviceId, Vec<StepId>>,
    pub objective: f64,
}

impl Plan {
    pub fn empty(now: DateTime<Utc>, mode: PlanMode) -> Self {
        Self {
            created_at: now,
            mode,
            assignments: HashMap::new(),
            device_queues: HashMap::new(),
            objective: 0.0,
        }
    }

    pub fn assignment(&self, step: StepId) -> Option<&Assignment> {
        self.assignments.get(&step)
    }

    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.assignments.values()
    }

    pub fn device_queue(&self, device: DeviceId) -> &[StepId] {
        self.device_queues
            .get(&device)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Expected finish of a step under this plan.
    pub fn eta(&self, step: StepId) -> Option<DateTime<Utc>> {
        self.assignment(step).map(Assignment::finish)
    }

    pub(crate) fn insert(&mut self, assignment: Assignment) {
        let queue = self.device_queues.entry(assignment.device).or_default();
        queue.push(assignment.step);
        self.assignments.insert(assignment.step, assignment);
    }

    pub(crate) fn finalize_queues(&mut self) {
        let assignments = &self.assignments;
        for queue in self.device_queues.values_mut() {
            queue.sort_by_key(|s| {
                assignments
                    .get(s)
                    .map(|a| (a.earliest_start, a.step))
                    .unwrap_or((DateTime::<Utc>::MAX_UTC, *s))
            });
        }
    }

    /// Re-checks every feasibility constraint against a snapshot.
    ///
    /// The solver maintains these constructively; this is the independent
    /// audit used by tests and debug builds.
    pub fn validate(&self, snapshot: &InstanceSnapshot) -> Result<(), PlanViolation> {
        let device_index: HashMap<DeviceId, &crate::instance::SnapshotDevice> =
            snapshot.devices.iter().map(|d| (d.id, d)).collect();

        // Every plannable step is assigned.
        for step in &snapshot.steps {
            if !self.assignments.contains_key(&step.id) {
                return Err(PlanViolation::Unassigned { step: step.id });
            }
        }

        // Wait windows against predecessor finishes.
        for step in &snapshot.steps {
            let start = self.assignments[&step.id].earliest_start;
            for dep in &step.deps {
                let pred_finish = snapshot
                    .fixed_finish
                    .get(&dep.pred)
                    .copied()
                    .or_else(|| self.eta(dep.pred));
                let Some(pred_finish) = pred_finish else {
                    continue;
                };
                let min_start = pred_finish + TimeDelta::from_std(dep.min).unwrap_or_default();
                if start < min_start {
                    return Err(PlanViolation::WaitWindow {
                        pred: dep.pred,
                        step: step.id,
                    });
                }
                if let Some(max) = dep.max {
                    let max_start = pred_finish + TimeDelta::from_std(max).unwrap_or_default();
                    if start > max_start {
                        return Err(PlanViolation::WaitWindow {
                            pred: dep.pred,
                            step: step.id,
                        });
                    }
                }
            }
        }

        // Per-device concurrency: batches count once; running steps count.
        for (device_id, queue) in &self.device_queues {
            let Some(device) = device_index.get(device_id) else {
                continue;
            };
            let mut intervals: Vec<(DateTime<Utc>, DateTime<Utc>, StepId)> = Vec::new();
            let mut seen_batch: Vec<StepId> = Vec::new();
            for step in queue {
                let a = &self.assignments[step];
                if !a.batch.is_empty() {
                    // One interval per batch run.
                    let leader = *a.batch.iter().min().expect("non-empty batch");
                    if seen_batch.contains(&leader) {
                        continue;
                    }
                    seen_batch.push(leader);
                }
                intervals.push((a.earliest_start, a.finish(), *step));
            }
            for run in &snapshot.running {
                if run.device == *device_id {
                    intervals.push((run.started, run.expected_finish, run.id));
                }
            }
            intervals.sort();
            // Point-in-time concurrency sweep over half-open intervals.
            let mut sweep: Vec<(DateTime<Utc>, i64)> = Vec::new();
            for (start, end, _) in &intervals {
                sweep.push((*start, 1));
                sweep.push((*end, -1));
            }
            sweep.sort_by_key(|(at, delta)| (*at, *delta));
            let mut concurrent: i64 = 0;
            for (at, delta) in sweep {
                concurrent += delta;
                if concurrent > device.process_capacity as i64 {
                    return Err(PlanViolation::CapacityExceeded {
                        device: *device_id,
                        at,
                    });
                }
            }
            if !device.allows_overlap {
                for (i, (start_a, end_a, id_a)) in intervals.iter().enumerate() {
                    for (start_b, end_b, id_b) in intervals.iter().skip(i + 1) {
                        if *start_b < *end_a && *start_a < *end_b {
                            return Err(PlanViolation::OverlapForbidden {
                                device: *device_id,
                                a: *id_a,
                                b: *id_b,
                            });
                        }
                    }
                }
            }
        }

        // Container exclusivity across the whole plan.
        let mut per_container: HashMap<ContainerId, Vec<(DateTime<Utc>, DateTime<Utc>, StepId)>> =
            HashMap::new();
        for step in &snapshot.steps {
            let a = &self.assignments[&step.id];
            for container in &step.containers {
                per_container.entry(*container).or_default().push((
                    a.earliest_start,
                    a.finish(),
                    step.id,
                ));
            }
        }
        for run in &snapshot.running {
            for container in &run.containers {
                per_container.entry(*container).or_default().push((
                    run.started,
                    run.expected_finish,
                    run.id,
                ));
            }
        }
        for (container, mut intervals) in per_container {
            intervals.sort();
            for pair in intervals.windows(2) {
                let (_, end_a, id_a) = pair[0];
                let (start_b, _, id_b) = pair[1];
                // Batched steps share an interval on purpose.
                let batched_together = self
                    .assignment(id_a)
                    .map(|a| a.batch.contains(&id_b))
                    .unwrap_or(false);
                if start_b < end_a && !batched_together {
                    return Err(PlanViolation::ContainerBusy {
                        container,
                        a: id_a,
                        b: id_b,
                    });
                }
            }
        }

        // Minimum occupancy on bundling devices.
        let step_index: HashMap<StepId, &crate::instance::SnapshotStep> =
            snapshot.steps.iter().map(|s| (s.id, s)).collect();
        for step in &snapshot.steps {
            let a = &self.assignments[&step.id];
            let Some(device) = device_index.get(&a.device) else {
                continue;
            };
            if device.min_capacity <= 1 {
                continue;
            }
            let members: Vec<StepId> = if a.batch.is_empty() {
                vec![step.id]
            } else {
                a.batch.clone()
            };
            let containers: usize = members
                .iter()
                .filter_map(|m| step_index.get(m))
                .map(|m| m.containers.len())
                .sum();
            if (containers as u32) < device.min_capacity {
                return Err(PlanViolation::BelowMinCapacity { step: step.id });
            }
        }

        // Container residency per device over time.
        let mut events: HashMap<DeviceId, BTreeMap<DateTime<Utc>, i64>> = HashMap::new();
        let mut location: HashMap<ContainerId, DeviceId> = snapshot.container_device.clone();
        for (container, device) in &location {
            events
                .entry(*device)
                .or_default()
                .entry(snapshot.taken_at)
                .and_modify(|d| *d += 1)
                .or_insert(1);
            let _ = container;
        }
        let mut moves: Vec<(DateTime<Utc>, ContainerId, DeviceId)> = snapshot
            .steps
            .iter()
            .filter(|s| s.is_movement)
            .filter_map(|s| {
                let a = &self.assignments[&s.id];
                s.containers
                    .first()
                    .map(|c| (a.earliest_start, *c, a.device))
            })
            .collect();
        moves.sort();
        for (at, container, destination) in moves {
            if let Some(source) = location.get(&container).copied() {
                events
                    .entry(source)
                    .or_default()
                    .entry(at)
                    .and_modify(|d| *d -= 1)
                    .or_insert(-1);
            }
            events
                .entry(destination)
                .or_default()
                .entry(at)
                .and_modify(|d| *d += 1)
                .or_insert(1);
            location.insert(container, destination);
        }
        for (device_id, timeline) in events {
            let Some(device) = device_index.get(&device_id) else {
                continue;
            };
            let mut count: i64 = 0;
            for (_, delta) in timeline {
                count += delta;
                if count > device.capacity as i64 {
                    return Err(PlanViolation::ResidencyExceeded { device: device_id });
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanViolation {
    #[error("step {step} has no assignment")]
    Unassigned { step: StepId },

    #[error("wait window violated between {pred} and {step}")]
    WaitWindow { pred: StepId, step: StepId },

    #[error("device {device} exceeds its process capacity at {at}")]
    CapacityExceeded {
        device: DeviceId,
        at: DateTime<Utc>,
    },

    #[error("device {device} forbids overlap but {a} and {b} overlap")]
    OverlapForbidden {
        device: DeviceId,
        a: StepId,
        b: StepId,
    },

    #[error("container {container} is used by overlapping steps {a} and {b}")]
    ContainerBusy {
        container: ContainerId,
        a: StepId,
        b: StepId,
    },

    #[error("step {step} runs below the device minimum occupancy")]
    BelowMinCapacity { step: StepId },

    #[error("container capacity of device {device} exceeded")]
    ResidencyExceeded { device: DeviceId },
}
