//! Resource-aware scheduler.
//!
//! The scheduler is a pure function: snapshot in, plan out. It never reads
//! the status store, never mutates the instance, and is bounded by the time
//! budget it is given; the core loop runs it on a worker and receives the
//! result as a message.
//!
//! The algorithm is event-driven list scheduling: steps (or minimum-occupancy
//! bundles) are placed one at a time onto the device of the required kind
//! with the earliest feasible start. The placement order is a fixed
//! tie-break chain: earliest possible start, then process priority (lower
//! number wins), then incoming wait-cost sum, then step id. Remaining
//! budget is spent on alternative device-preference passes, keeping the
//! cheapest plan found.
//!
//! Infeasibility is a normal result, not a panic: the error carries the most
//! recent feasible plan so the executor keeps driving work that is already
//! placed, plus the processes that cannot be planned.

pub mod plan;

pub use plan::{Assignment, Plan, PlanMode, PlanViolation};

use crate::core::{ContainerId, DeviceId, DeviceKind, ProcessId, StepId};
use crate::instance::{InstanceSnapshot, SnapshotDevice, SnapshotStep};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("no feasible plan: {reason}")]
    Infeasible {
        reason: String,
        /// Processes proven unplannable under current constraints.
        unschedulable: Vec<ProcessId>,
        /// Most recent feasible plan, so execution keeps progressing.
        previous: Option<Box<Plan>>,
    },
}

impl SchedError {
    fn infeasible(reason: String, unschedulable: Vec<ProcessId>) -> Self {
        SchedError::Infeasible {
            reason,
            unschedulable,
            previous: None,
        }
    }

    fn with_previous(mut self, plan: Option<&Plan>) -> Self {
        let SchedError::Infeasible { previous, .. } = &mut self;
        *previous = plan.cloned().map(Box::new);
        self
    }
}

/// Produces a feasible plan for every plannable step in the snapshot.
pub fn schedule(
    snapshot: &InstanceSnapshot,
    now: DateTime<Utc>,
    budget: Duration,
    mode: PlanMode,
    previous: Option<&Plan>,
) -> Result<Plan, SchedError> {
    let deadline = Instant::now() + budget;

    structural_check(snapshot).map_err(|e| e.with_previous(previous))?;
    let units = build_units(snapshot).map_err(|e| e.with_previous(previous))?;

    let variants: usize = match mode {
        PlanMode::Short => 2,
        PlanMode::Long => 4,
    };
    let mut best: Option<Plan> = None;
    let mut first_error: Option<SchedError> = None;
    for variant in 0..variants {
        if variant > 0 && Instant::now() >= deadline {
            break;
        }
        match greedy(snapshot, now, mode, previous, &units, variant) {
            Ok(plan) => {
                let better = best
                    .as_ref()
                    .map(|b| plan.objective < b.objective)
                    .unwrap_or(true);
                if better {
                    best = Some(plan);
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    // A previous plan still covering every step competes on the objective;
    // this keeps short re-plans from churning assignments for no gain.
    if mode == PlanMode::Short {
        if let Some(prev) = previous {
            let covers = snapshot
                .steps
                .iter()
                .all(|s| prev.assignment(s.id).is_some());
            if covers && prev.validate(snapshot).is_ok() {
                let objective = plan_objective(prev, snapshot, now);
                let better = best
                    .as_ref()
                    .map(|b| objective < b.objective)
                    .unwrap_or(true);
                if better {
                    let mut kept = prev.clone();
                    kept.objective = objective;
                    best = Some(kept);
                }
            }
        }
    }

    match best {
        Some(plan) => {
            debug!(
                steps = plan.len(),
                objective = plan.objective,
                ?mode,
                "plan computed"
            );
            Ok(plan)
        }
        None => {
            let error = first_error.unwrap_or_else(|| {
                SchedError::infeasible("no plan variant succeeded".into(), Vec::new())
            });
            Err(error.with_previous(previous))
        }
    }
}

// ---------------------------------------------------------------------
// Structural feasibility
// ---------------------------------------------------------------------

fn usable_devices(snapshot: &InstanceSnapshot) -> HashMap<DeviceKind, Vec<&SnapshotDevice>> {
    let mut by_kind: HashMap<DeviceKind, Vec<&SnapshotDevice>> = HashMap::new();
    for device in snapshot.devices.iter().filter(|d| d.capacity > 0) {
        by_kind.entry(device.kind).or_default().push(device);
    }
    for devices in by_kind.values_mut() {
        devices.sort_by(|a, b| a.name.cmp(&b.name));
    }
    by_kind
}

/// Constraints no amount of waiting can satisfy.
fn structural_check(snapshot: &InstanceSnapshot) -> Result<(), SchedError> {
    let by_kind = usable_devices(snapshot);

    for step in &snapshot.steps {
        if by_kind.get(&step.kind).map_or(true, |d| d.is_empty()) {
            return Err(SchedError::infeasible(
                format!("no usable {} device for step {}", step.kind, step.fct),
                vec![step.process],
            ));
        }
    }

    // Minimum-occupancy kinds: the union of compatible containers must be
    // able to reach some device's minimum.
    for (kind, devices) in &by_kind {
        if !devices.iter().all(|d| d.min_capacity > 1) {
            continue;
        }
        let lowest_min = devices.iter().map(|d| d.min_capacity).min().unwrap_or(1);
        let mut groups: HashMap<&str, (usize, HashSet<ProcessId>)> = HashMap::new();
        for step in snapshot.steps.iter().filter(|s| s.kind == *kind) {
            let entry = groups.entry(step.batch_key.as_str()).or_default();
            entry.0 += step.containers.len();
            entry.1.insert(step.process);
        }
        for (key, (containers, processes)) in groups {
            if (containers as u32) < lowest_min {
                let mut unschedulable: Vec<ProcessId> = processes.into_iter().collect();
                unschedulable.sort();
                return Err(SchedError::infeasible(
                    format!(
                        "{} containers for {} cannot reach the device minimum of {}",
                        containers, key, lowest_min
                    ),
                    unschedulable,
                ));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------
// Units: single steps or minimum-occupancy bundles
// ---------------------------------------------------------------------

#[derive(Clone, Debug)]
struct Unit {
    steps: Vec<StepId>,
}

fn build_units(snapshot: &InstanceSnapshot) -> Result<Vec<Unit>, SchedError> {
    let by_kind = usable_devices(snapshot);
    let bundling_kinds: HashSet<DeviceKind> = by_kind
        .iter()
        .filter(|(_, devices)| devices.iter().all(|d| d.min_capacity > 1))
        .map(|(kind, _)| *kind)
        .collect();

    let mut units = Vec::new();
    let mut grouped: BTreeMap<(String, String), Vec<&SnapshotStep>> = BTreeMap::new();
    for step in &snapshot.steps {
        if bundling_kinds.contains(&step.kind) {
            grouped
                .entry((step.kind.to_string(), step.batch_key.clone()))
                .or_default()
                .push(step);
        } else {
            units.push(Unit {
                steps: vec![step.id],
            });
        }
    }

    for ((kind_name, key), mut members) in grouped {
        let kind = members[0].kind;
        let devices = &by_kind[&kind];
        let max_capacity = devices.iter().map(|d| d.capacity).max().unwrap_or(0) as usize;
        let lowest_min = devices.iter().map(|d| d.min_capacity).min().unwrap_or(1) as usize;
        members.sort_by_key(|s| (s.earliest_allowed, s.id));

        // Fill runs up to the largest device, then rebalance a thin tail.
        let mut chunks: Vec<Vec<&SnapshotStep>> = Vec::new();
        let mut current: Vec<&SnapshotStep> = Vec::new();
        let mut current_containers = 0usize;
        for step in members {
            let needed = step.containers.len();
            if current_containers + needed > max_capacity && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_containers = 0;
            }
            current_containers += needed;
            current.push(step);
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        let tail_size =
            |chunk: &Vec<&SnapshotStep>| chunk.iter().map(|s| s.containers.len()).sum::<usize>();
        if chunks.len() > 1 {
            if let Some(last) = chunks.last() {
                if tail_size(last) < lowest_min {
                    let tail = chunks.pop().unwrap_or_default();
                    'outer: for step in tail {
                        for chunk in chunks.iter_mut() {
                            if tail_size(chunk) + step.containers.len() <= max_capacity {
                                chunk.push(step);
                                continue 'outer;
                            }
                        }
                        let processes = vec![step.process];
                        return Err(SchedError::infeasible(
                            format!("cannot fill a {} run for {}", kind_name, key),
                            processes,
                        ));
                    }
                }
            }
        }

        for chunk in chunks {
            units.push(Unit {
                steps: chunk.iter().map(|s| s.id).collect(),
            });
        }
    }

    Ok(units)
}

// ---------------------------------------------------------------------
// Greedy placement
// ---------------------------------------------------------------------

struct DeviceState {
    /// Busy intervals of planned and running operations.
    intervals: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    /// Container residency deltas over time.
    resident: BTreeMap<DateTime<Utc>, i64>,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            intervals: Vec::new(),
            resident: BTreeMap::new(),
        }
    }

    fn add_resident(&mut self, at: DateTime<Utc>, delta: i64) {
        *self.resident.entry(at).or_insert(0) += delta;
    }

    /// Whether one more resident container fits at every instant from `t` on.
    ///
    /// Conservative: departures not yet planned do not exist, so a full
    /// device stays full; callers defer the unit and retry after more of
    /// the plan has taken shape.
    fn residency_fits(&self, t: DateTime<Utc>, capacity: u32) -> bool {
        let mut count: i64 = self
            .resident
            .iter()
            .filter(|(at, _)| **at <= t)
            .map(|(_, delta)| *delta)
            .sum();
        let mut max = count;
        for (_, delta) in self.resident.iter().filter(|(at, _)| **at > t) {
            count += delta;
            max = max.max(count);
        }
        max + 1 <= capacity as i64
    }

    /// Pointwise concurrency within a window, among existing intervals.
    fn concurrency_in(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
        let mut events: Vec<(DateTime<Utc>, i64)> = Vec::new();
        for (s, e) in &self.intervals {
            if *s < end && start < *e {
                events.push(((*s).max(start), 1));
                events.push(((*e).min(end), -1));
            }
        }
        events.sort_by_key(|(at, delta)| (*at, *delta));
        let mut count = 0i64;
        let mut max = 0i64;
        for (_, delta) in events {
            count += delta;
            max = max.max(count);
        }
        max
    }

    /// Earliest start >= `est` satisfying concurrency (and, for arrivals,
    /// residency). `None` when residency can never fit.
    fn earliest_fit(
        &self,
        est: DateTime<Utc>,
        duration: Duration,
        device: &SnapshotDevice,
        arriving: bool,
    ) -> Option<DateTime<Utc>> {
        let dur = TimeDelta::from_std(duration).unwrap_or_default();
        let mut candidates: Vec<DateTime<Utc>> = vec![est];
        candidates.extend(self.intervals.iter().map(|(_, end)| *end).filter(|t| *t > est));
        if arriving {
            candidates.extend(self.resident.keys().copied().filter(|t| *t > est));
        }
        candidates.sort();
        candidates.dedup();
        for t in candidates {
            let end = t + dur;
            let concurrent = self.concurrency_in(t, end);
            let fits_ops = if device.allows_overlap {
                concurrent + 1 <= device.process_capacity as i64
            } else {
                concurrent == 0
            };
            if !fits_ops {
                continue;
            }
            if arriving && !self.residency_fits(t, device.capacity) {
                continue;
            }
            return Some(t);
        }
        None
    }
}

#[allow(clippy::too_many_arguments)]
fn greedy(
    snapshot: &InstanceSnapshot,
    now: DateTime<Utc>,
    mode: PlanMode,
    previous: Option<&Plan>,
    units: &[Unit],
    variant: usize,
) -> Result<Plan, SchedError> {
    let step_index: HashMap<StepId, &SnapshotStep> =
        snapshot.steps.iter().map(|s| (s.id, s)).collect();
    let by_kind = usable_devices(snapshot);

    let mut devices: HashMap<DeviceId, DeviceState> = snapshot
        .devices
        .iter()
        .map(|d| (d.id, DeviceState::new()))
        .collect();

    // Seed residency with the current container locations.
    let mut container_loc: HashMap<ContainerId, DeviceId> = snapshot.container_device.clone();
    for device in container_loc.values() {
        if let Some(state) = devices.get_mut(device) {
            state.add_resident(now, 1);
        }
    }

    // Running steps occupy their device; running movements relocate their
    // container at the expected finish.
    let mut finish: HashMap<StepId, DateTime<Utc>> = snapshot.fixed_finish.clone();
    let mut container_free: HashMap<ContainerId, DateTime<Utc>> = HashMap::new();
    for run in &snapshot.running {
        if let Some(state) = devices.get_mut(&run.device) {
            state.intervals.push((run.started, run.expected_finish));
        }
        for container in &run.containers {
            container_free.insert(*container, run.expected_finish);
            if run.is_movement {
                if let Some(source) = container_loc.get(container).copied() {
                    if source != run.device {
                        if let Some(state) = devices.get_mut(&source) {
                            state.add_resident(run.expected_finish, -1);
                        }
                        if let Some(state) = devices.get_mut(&run.device) {
                            state.add_resident(run.expected_finish, 1);
                        }
                    }
                }
                container_loc.insert(*container, run.device);
            }
        }
    }

    let mut plan = Plan::empty(now, mode);
    let mut pending: Vec<usize> = (0..units.len()).collect();

    while !pending.is_empty() {
        // Units whose dependencies all have known finishes.
        struct Candidate {
            est: DateTime<Utc>,
            latest: DateTime<Utc>,
            priority: i32,
            wait_cost: f64,
            lead_step: StepId,
            index: usize,
        }
        let mut candidates: Vec<Candidate> = Vec::new();
        for index in &pending {
            let unit = &units[*index];
            let inside: HashSet<StepId> = unit.steps.iter().copied().collect();
            let mut est = now;
            let mut latest = DateTime::<Utc>::MAX_UTC;
            let mut priority = i32::MAX;
            let mut wait_cost = 0.0;
            let mut ready = true;
            for step_id in &unit.steps {
                let step = step_index[step_id];
                est = est.max(step.earliest_allowed);
                priority = priority.min(step.priority);
                wait_cost += step.wait_cost_sum;
                for dep in &step.deps {
                    if inside.contains(&dep.pred) {
                        continue;
                    }
                    let Some(pred_finish) = finish.get(&dep.pred) else {
                        ready = false;
                        break;
                    };
                    est = est.max(*pred_finish + TimeDelta::from_std(dep.min).unwrap_or_default());
                    if let Some(max) = dep.max {
                        latest =
                            latest.min(*pred_finish + TimeDelta::from_std(max).unwrap_or_default());
                    }
                }
                if !ready {
                    break;
                }
                for container in &step.containers {
                    if let Some(free) = container_free.get(container) {
                        est = est.max(*free);
                    }
                }
            }
            if ready {
                candidates.push(Candidate {
                    est,
                    latest,
                    priority,
                    wait_cost,
                    lead_step: unit.steps.iter().copied().min().unwrap_or(StepId(0)),
                    index: *index,
                });
            }
        }
        if candidates.is_empty() {
            let processes: Vec<ProcessId> = pending
                .iter()
                .flat_map(|i| units[*i].steps.iter())
                .filter_map(|s| step_index.get(s).map(|s| s.process))
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            return Err(SchedError::infeasible(
                "dependency deadlock among pending steps".into(),
                processes,
            ));
        }

        // Normative tie-break order.
        candidates.sort_by(|a, b| {
            a.est
                .cmp(&b.est)
                .then(a.priority.cmp(&b.priority))
                .then(a.wait_cost.partial_cmp(&b.wait_cost).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.lead_step.cmp(&b.lead_step))
        });

        let mut placed = false;
        let mut window_error: Option<SchedError> = None;
        for candidate in &candidates {
            let unit = &units[candidate.index];
            match place_unit(
                unit,
                candidate.est,
                candidate.latest,
                &step_index,
                &by_kind,
                &mut devices,
                &mut container_loc,
                &mut container_free,
                &mut finish,
                &mut plan,
                previous.filter(|_| mode == PlanMode::Short),
                variant,
            ) {
                Ok(true) => {
                    pending.retain(|i| *i != candidate.index);
                    placed = true;
                    break;
                }
                Ok(false) => continue,
                Err(e) => {
                    if window_error.is_none() {
                        window_error = Some(e);
                    }
                    continue;
                }
            }
        }
        if !placed {
            let error = window_error.unwrap_or_else(|| {
                let lead = &candidates[0];
                let step = step_index[&lead.lead_step];
                SchedError::infeasible(
                    format!("no {} device ever frees up for {}", step.kind, step.fct),
                    vec![step.process],
                )
            });
            return Err(error);
        }
    }

    plan.finalize_queues();
    plan.objective = plan_objective(&plan, snapshot, now);
    trace!(objective = plan.objective, variant, "greedy pass finished");
    Ok(plan)
}

/// Places one unit on the cheapest feasible device.
///
/// `Ok(false)` means "defer": no device currently fits (e.g. residency is
/// blocked until a later departure is planned). An error means the unit's
/// wait window can never be met.
#[allow(clippy::too_many_arguments)]
fn place_unit(
    unit: &Unit,
    est: DateTime<Utc>,
    latest: DateTime<Utc>,
    step_index: &HashMap<StepId, &SnapshotStep>,
    by_kind: &HashMap<DeviceKind, Vec<&SnapshotDevice>>,
    devices: &mut HashMap<DeviceId, DeviceState>,
    container_loc: &mut HashMap<ContainerId, DeviceId>,
    container_free: &mut HashMap<ContainerId, DateTime<Utc>>,
    finish: &mut HashMap<StepId, DateTime<Utc>>,
    plan: &mut Plan,
    previous: Option<&Plan>,
    variant: usize,
) -> Result<bool, SchedError> {
    let members: Vec<&SnapshotStep> = unit.steps.iter().map(|s| step_index[s]).collect();
    let lead = members[0];
    let duration = members
        .iter()
        .map(|s| s.duration)
        .max()
        .unwrap_or(Duration::ZERO);
    let total_containers: usize = members.iter().map(|s| s.containers.len()).sum();
    let arriving = lead.is_movement;

    let mut candidates: Vec<&SnapshotDevice> = by_kind
        .get(&lead.kind)
        .map(|d| d.to_vec())
        .unwrap_or_default();
    if candidates.is_empty() {
        return Ok(false);
    }
    let candidates_len = candidates.len();
    candidates.rotate_left(variant % candidates_len);
    // Short mode: stay on the previously assigned device when possible.
    if let Some(prev) = previous {
        if let Some(assignment) = prev.assignment(lead.id) {
            if let Some(pos) = candidates.iter().position(|d| d.id == assignment.device) {
                candidates.swap(0, pos);
            }
        }
    }

    let mut best: Option<(DateTime<Utc>, usize, &SnapshotDevice)> = None;
    for device in candidates {
        if (total_containers as u32) < device.min_capacity {
            continue;
        }
        if device.capacity < total_containers as u32 {
            continue;
        }
        let state = &devices[&device.id];
        let Some(start) = state.earliest_fit(est, duration, device, arriving) else {
            continue;
        };
        let queued = state.intervals.len();
        let better = match &best {
            None => true,
            Some((bs, bq, bd)) => {
                (start, queued, device.name.as_str()) < (*bs, *bq, bd.name.as_str())
            }
        };
        if better {
            best = Some((start, queued, device));
        }
    }

    let Some((start, _, device)) = best else {
        return Ok(false);
    };
    if start > latest {
        return Err(SchedError::infeasible(
            format!(
                "wait window of step {} closes before {} frees up",
                lead.id, device.name
            ),
            vec![lead.process],
        ));
    }

    let end = start + TimeDelta::from_std(duration).unwrap_or_default();
    let state = devices.get_mut(&device.id).expect("known device");
    state.intervals.push((start, end));
    let batch: Vec<StepId> = if unit.steps.len() > 1 {
        unit.steps.clone()
    } else {
        Vec::new()
    };
    for member in &members {
        finish.insert(member.id, end);
        for container in &member.containers {
            container_free.insert(*container, end);
        }
        plan.insert(Assignment {
            step: member.id,
            device: device.id,
            earliest_start: start,
            latest_start: latest,
            duration,
            batch: batch.clone(),
        });
    }
    if arriving {
        for member in &members {
            for container in &member.containers {
                if let Some(source) = container_loc.get(container).copied() {
                    if source != device.id {
                        if let Some(src_state) = devices.get_mut(&source) {
                            src_state.add_resident(start, -1);
                        }
                    }
                }
                container_loc.insert(*container, device.id);
            }
        }
        if let Some(dst_state) = devices.get_mut(&device.id) {
            for member in &members {
                for _ in &member.containers {
                    dst_state.add_resident(start, 1);
                }
            }
        }
    }
    Ok(true)
}

/// Σ(edge wait cost × idle seconds) + Σ(process priority × makespan).
fn plan_objective(plan: &Plan, snapshot: &InstanceSnapshot, now: DateTime<Utc>) -> f64 {
    let mut cost = 0.0;
    let mut process_makespan: HashMap<ProcessId, f64> = HashMap::new();
    let mut process_priority: HashMap<ProcessId, i32> = HashMap::new();
    for step in &snapshot.steps {
        let Some(assignment) = plan.assignment(step.id) else {
            continue;
        };
        for dep in &step.deps {
            let pred_finish = snapshot
                .fixed_finish
                .get(&dep.pred)
                .copied()
                .or_else(|| plan.eta(dep.pred));
            if let Some(pred_finish) = pred_finish {
                let idle = (assignment.earliest_start - pred_finish)
                    .to_std()
                    .unwrap_or_default()
                    .as_secs_f64();
                cost += dep.cost * idle;
            }
        }
        let makespan = (assignment.finish() - now)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        let entry = process_makespan.entry(step.process).or_insert(0.0);
        *entry = entry.max(makespan);
        process_priority.insert(step.process, step.priority);
    }
    for (process, makespan) in process_makespan {
        let priority = process_priority.get(&process).copied().unwrap_or(0);
        cost += priority as f64 * makespan;
    }
    cost
}
