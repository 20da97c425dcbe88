//! End-to-end orchestration over simulated adapters.
//!
//! Each test boots a full orchestrator with an in-memory journal, submits
//! workflows through the control handle, and asserts on committed history
//! and container state.

use labflow::adapters::AdapterRegistry;
use labflow::app::Orchestrator;
use labflow::config::LabConfig;
use labflow::core::{DeviceKind, ParamValue, Position, ProcessId};
use labflow::error::{LabError, LabResult};
use labflow::graph::builder::{GraphBuilder, ProcessParser};
use labflow::graph::{Cmp, Expr, LabwareNode, Predicate, WorkflowGraph};
use labflow::instance::{ProcessState, StepState};
use labflow::messages::{LabHandle, ProcessReport, Scope, StatusReport};
use labflow::store::history::StepStatus;
use labflow::store::persistence::{Journal, MemoryBackend, StorageBackend};
use labflow::store::StatusStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const LAB_DOC: &str = r#"
description: integration lab
devices:
  storage:
    Hotel:
      capacity: 8
      allows_overlap: true
  incubators:
    Incubator1:
      capacity: 4
      process_capacity: 4
      allows_overlap: true
  plate_readers:
    Reader:
      capacity: 1
  centrifuges:
    C:
      capacity: 4
      min_capacity: 4
"#;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn test_config(speed: f64) -> LabConfig {
    let mut config = LabConfig::from_document(LAB_DOC).expect("lab doc");
    config.executor.poll_interval_ms = 20;
    config.executor.deviation_slack_secs = 5.0;
    config.executor.cancel_grace_secs = 2.0;
    config.executor.unschedulable_deadline_secs = 1.0;
    config.scheduler.short_budget_ms = 50;
    config.scheduler.long_budget_ms = 100;
    config.simulation.enabled = true;
    config.simulation.speed = speed;
    config
}

/// Test parser: the "source" is a key into pre-built graphs.
struct MapParser(HashMap<String, WorkflowGraph>);

impl ProcessParser for MapParser {
    fn parse(&self, source: &str, _name: &str) -> LabResult<WorkflowGraph> {
        self.0
            .get(source)
            .cloned()
            .ok_or_else(|| LabError::Parse(format!("unknown source {}", source)))
    }
}

fn launch(
    config: LabConfig,
    graphs: Vec<(&str, WorkflowGraph)>,
) -> (LabHandle, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let (journal, _writer) = Journal::spawn(Box::new(Arc::clone(&backend)));
    let store = StatusStore::new(&config.catalogue()).with_journal(journal);
    let registry = AdapterRegistry::simulated(config.simulation.speed);
    let parser = MapParser(
        graphs
            .into_iter()
            .map(|(key, graph)| (key.to_string(), graph))
            .collect(),
    );
    let (handle, _core) = Orchestrator::spawn(config, store, registry, Arc::new(parser));
    (handle, backend)
}

fn device_id(name: &str) -> labflow::core::DeviceId {
    let config = LabConfig::from_document(LAB_DOC).expect("lab doc");
    StatusStore::new(&config.catalogue())
        .device_by_name(name)
        .expect("device")
        .id
}

async fn wait_for<F>(handle: &LabHandle, timeout: Duration, predicate: F) -> StatusReport
where
    F: Fn(&StatusReport) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let report = handle.query_status(None).await.expect("status");
        if predicate(&report) {
            return report;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time; last report: {:#?}",
            report
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn process<'a>(report: &'a StatusReport, id: ProcessId) -> &'a ProcessReport {
    report
        .processes
        .iter()
        .find(|p| p.id == id)
        .expect("process in report")
}

fn terminal(report: &StatusReport, id: ProcessId) -> bool {
    report
        .processes
        .iter()
        .find(|p| p.id == id)
        .map(|p| p.state.is_terminal())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------
// Scenario: single plate, move - incubate - read
// ---------------------------------------------------------------------

fn linear_graph() -> WorkflowGraph {
    let mut b = GraphBuilder::new("move-incubate-read");
    let plate = b.labware("P1", "Hotel", 0);
    let to_inc = b.movement(DeviceKind::Incubator, secs(5), "P1");
    let incubate = b.operation("incubate", DeviceKind::Incubator, secs(60), &["P1"]);
    if let Some(op) = b.operation_mut(incubate) {
        op.params.insert("temp".into(), ParamValue::Float(310.0));
    }
    let to_reader = b.movement(DeviceKind::PlateReader, secs(5), "P1");
    let measure = b.operation("measure", DeviceKind::PlateReader, secs(5), &["P1"]);
    b.connect(plate, to_inc).container = Some("P1".into());
    b.connect(to_inc, incubate).container = Some("P1".into());
    b.connect(incubate, to_reader).container = Some("P1".into());
    b.connect(to_reader, measure).container = Some("P1".into());
    b.build().expect("valid graph")
}

#[tokio::test]
async fn test_move_incubate_read() {
    let speed = 30.0;
    let (handle, backend) = launch(test_config(speed), vec![("linear", linear_graph())]);
    let id = handle
        .submit_process("linear", "run-1", None, 1)
        .await
        .expect("submit");
    handle.start(vec![id]).await.expect("start");

    let report = wait_for(&handle, secs(30), |r| terminal(r, id)).await;
    assert_eq!(process(&report, id).state, ProcessState::Completed);

    // One history record per step, all committed in order.
    let steps = backend.load_steps().await.expect("history");
    assert_eq!(steps.len(), 4);
    assert!(steps.iter().all(|s| s.status == StepStatus::Ok));
    assert!(steps.iter().all(|s| s.is_simulation));

    let moves: Vec<_> = steps
        .iter()
        .filter_map(|s| s.movement.as_ref())
        .collect();
    assert_eq!(moves.len(), 2);
    assert_eq!(moves[0].source_kind, DeviceKind::Storage);
    assert_eq!(moves[0].target_kind, DeviceKind::Incubator);
    assert_eq!(moves[1].source_kind, DeviceKind::Incubator);
    assert_eq!(moves[1].target_kind, DeviceKind::PlateReader);

    // The incubation really took its (accelerated) 60 seconds.
    let incubate = steps
        .iter()
        .find(|s| s.step_name == "incubate")
        .expect("incubate record");
    assert!(incubate.elapsed() >= Duration::from_secs_f64(60.0 / speed * 0.9));
    assert_eq!(
        incubate.params.get("temp").and_then(|v| v.as_f64()),
        Some(310.0)
    );

    // Committed position sequence ends at the reader.
    let containers = backend.container_rows();
    let plate = containers.iter().find(|c| !c.removed).expect("container");
    assert_eq!(plate.current_pos.device, device_id("Reader"));
}

// ---------------------------------------------------------------------
// Scenario: centrifuge minimum occupancy never reachable
// ---------------------------------------------------------------------

fn centrifuge_graph() -> WorkflowGraph {
    let mut b = GraphBuilder::new("undersized-spin");
    let a = b.labware("A", "Hotel", 0);
    let bb = b.labware("B", "Hotel", 1);
    let move_a = b.movement(DeviceKind::Centrifuge, secs(5), "A");
    let move_b = b.movement(DeviceKind::Centrifuge, secs(5), "B");
    let spin = b.operation("spin", DeviceKind::Centrifuge, secs(30), &["A", "B"]);
    b.connect(a, move_a).container = Some("A".into());
    b.connect(bb, move_b).container = Some("B".into());
    b.connect(move_a, spin).container = Some("A".into());
    b.connect(move_b, spin).container = Some("B".into());
    b.build().expect("valid graph")
}

#[tokio::test]
async fn test_centrifuge_min_capacity_unschedulable() {
    let (handle, backend) = launch(test_config(50.0), vec![("spin", centrifuge_graph())]);
    let id = handle
        .submit_process("spin", "spin-run", None, 1)
        .await
        .expect("submit");
    handle.start(vec![id]).await.expect("start");

    let report = wait_for(&handle, secs(15), |r| terminal(r, id)).await;
    let p = process(&report, id);
    assert_eq!(p.state, ProcessState::Failed);
    let error = p.error.as_deref().expect("error reported");
    assert!(error.contains("unschedulable"), "error was: {}", error);

    // The centrifuge step was never dispatched.
    let steps = backend.load_steps().await.expect("history");
    assert!(steps.iter().all(|s| s.step_name != "spin"));
}

// ---------------------------------------------------------------------
// Scenario: lid lifecycle
// ---------------------------------------------------------------------

fn lid_graph() -> WorkflowGraph {
    let mut b = GraphBuilder::new("lid-cycle");
    let plate = b.labware_with(LabwareNode {
        container: "P2".into(),
        device: "Hotel".into(),
        slot: 1,
        lidded: true,
        labware_type: None,
        deep_well: false,
    });
    // Travel open; the lid parks on the slot the plate vacates.
    let to_reader = b.movement(DeviceKind::PlateReader, secs(5), "P2");
    if let Some(op) = b.operation_mut(to_reader) {
        op.params.insert("lidded".into(), ParamValue::Bool(false));
    }
    let read = b.operation("measure", DeviceKind::PlateReader, secs(5), &["P2"]);
    let back = b.movement(DeviceKind::Storage, secs(5), "P2");
    if let Some(op) = b.operation_mut(back) {
        op.params.insert("lidded".into(), ParamValue::Bool(true));
        op.params.insert("dst_slot".into(), ParamValue::Int(1));
    }
    b.connect(plate, to_reader).container = Some("P2".into());
    b.connect(to_reader, read).container = Some("P2".into());
    b.connect(read, back).container = Some("P2".into());
    b.build().expect("valid graph")
}

#[tokio::test]
async fn test_lid_lifecycle() {
    let (handle, backend) = launch(test_config(30.0), vec![("lid", lid_graph())]);
    let id = handle
        .submit_process("lid", "lid-run", None, 1)
        .await
        .expect("submit");
    handle.start(vec![id]).await.expect("start");

    let report = wait_for(&handle, secs(30), |r| terminal(r, id)).await;
    assert_eq!(process(&report, id).state, ProcessState::Completed);

    let containers = backend.container_rows();
    let plate = containers.iter().find(|c| !c.removed).expect("container");
    assert_eq!(plate.current_pos, Position::new(device_id("Hotel"), 1));
    assert!(plate.lidded);
    assert_eq!(plate.lid_pos, None);

    // The outbound move parked the lid; the return travelled lidded.
    let steps = backend.load_steps().await.expect("history");
    let moves: Vec<_> = steps.iter().filter_map(|s| s.movement.as_ref()).collect();
    assert_eq!(moves.len(), 2);
    assert!(!moves[0].lidded);
    assert_eq!(
        moves[0].lid_parked_at,
        Some(Position::new(device_id("Hotel"), 1))
    );
    assert!(moves[1].lidded);
}

// ---------------------------------------------------------------------
// Scenario: runtime branch on a measured value
// ---------------------------------------------------------------------

fn branch_graph() -> WorkflowGraph {
    let mut b = GraphBuilder::new("density-check");
    let plate = b.labware("P3", "Hotel", 0);
    let to_reader = b.movement(DeviceKind::PlateReader, secs(5), "P3");
    let measure = b.operation("measure", DeviceKind::PlateReader, secs(5), &["P3"]);
    if let Some(op) = b.operation_mut(measure) {
        op.params.insert("sim_value".into(), ParamValue::Float(0.45));
    }
    let od = b.variable("od");
    let branch = b.branch(
        "od-check",
        Predicate {
            lhs: Expr::Value { node: od },
            cmp: Cmp::Gt,
            rhs: Expr::Const { value: 0.6 },
        },
    );
    // Dense enough: park the plate. Too thin: grow it some more.
    let park = b.movement(DeviceKind::Storage, secs(5), "P3");
    let to_inc = b.movement(DeviceKind::Incubator, secs(5), "P3");
    let grow = b.operation("incubate", DeviceKind::Incubator, secs(20), &["P3"]);
    b.connect(plate, to_reader).container = Some("P3".into());
    b.connect(to_reader, measure).container = Some("P3".into());
    b.connect(measure, od);
    b.connect(od, branch);
    b.connect(branch, park).arm = Some(true);
    b.connect(branch, to_inc).arm = Some(false);
    b.connect(to_inc, grow).container = Some("P3".into());
    b.build().expect("valid graph")
}

#[tokio::test]
async fn test_runtime_branch_takes_false_arm() {
    let (handle, backend) = launch(test_config(30.0), vec![("branch", branch_graph())]);
    let id = handle
        .submit_process("branch", "branch-run", None, 1)
        .await
        .expect("submit");
    handle.start(vec![id]).await.expect("start");

    let report = wait_for(&handle, secs(30), |r| terminal(r, id)).await;
    let p = process(&report, id);
    assert_eq!(p.state, ProcessState::Completed);

    // Exactly one step (the winning-side alternative) was pruned.
    let pruned: Vec<_> = p
        .steps
        .iter()
        .filter(|s| s.state == StepState::Pruned)
        .collect();
    assert_eq!(pruned.len(), 1);

    // 0.45 is not > 0.6: the extra incubation ran.
    let steps = backend.load_steps().await.expect("history");
    assert_eq!(
        steps.iter().filter(|s| s.step_name == "incubate").count(),
        1
    );
    let containers = backend.container_rows();
    let plate = containers.iter().find(|c| !c.removed).expect("container");
    assert_eq!(plate.current_pos.device, device_id("Incubator1"));
}

// ---------------------------------------------------------------------
// Scenario: cancellation mid-flight
// ---------------------------------------------------------------------

fn cancellable_graph(ignore_cancel: bool) -> WorkflowGraph {
    let mut b = GraphBuilder::new("cancel-me");
    let plate = b.labware("P4", "Hotel", 0);
    let to_inc = b.movement(DeviceKind::Incubator, secs(2), "P4");
    let incubate = b.operation("incubate", DeviceKind::Incubator, secs(120), &["P4"]);
    if ignore_cancel {
        if let Some(op) = b.operation_mut(incubate) {
            op.params
                .insert("sim_ignore_cancel".into(), ParamValue::Bool(true));
        }
    }
    let back = b.movement(DeviceKind::Storage, secs(2), "P4");
    b.connect(plate, to_inc).container = Some("P4".into());
    b.connect(to_inc, incubate).container = Some("P4".into());
    b.connect(incubate, back).container = Some("P4".into());
    b.build().expect("valid graph")
}

async fn wait_until_running(handle: &LabHandle, id: ProcessId, fct: &str) {
    let fct = fct.to_string();
    wait_for(handle, secs(20), |r| {
        r.processes
            .iter()
            .find(|p| p.id == id)
            .map(|p| {
                p.steps
                    .iter()
                    .any(|s| s.fct == fct && s.state == StepState::Running)
            })
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_cancel_honoured_mid_incubation() {
    let (handle, backend) = launch(test_config(10.0), vec![("c", cancellable_graph(false))]);
    let id = handle
        .submit_process("c", "cancel-run", None, 1)
        .await
        .expect("submit");
    handle.start(vec![id]).await.expect("start");
    wait_until_running(&handle, id, "incubate").await;

    handle.cancel(Scope::Process(id)).await.expect("cancel");
    let report = wait_for(&handle, secs(20), |r| terminal(r, id)).await;
    let p = process(&report, id);
    assert_eq!(p.state, ProcessState::Cancelled);

    // The incubation was cut short without a commit; the container stays
    // where it was, and no later step of the workflow ran.
    let steps = backend.load_steps().await.expect("history");
    let incubate = steps.iter().find(|s| s.step_name == "incubate");
    assert!(incubate.is_some_and(|s| s.status == StepStatus::Cancelled));
    assert_eq!(
        steps.iter().filter(|s| s.movement.is_some()).count(),
        1,
        "only the first movement ran"
    );
    let containers = backend.container_rows();
    let plate = containers.iter().find(|c| !c.removed).expect("container");
    assert_eq!(plate.current_pos.device, device_id("Incubator1"));
}

#[tokio::test]
async fn test_cancel_ignored_completes_then_drops_successors() {
    let (handle, backend) = launch(test_config(40.0), vec![("c", cancellable_graph(true))]);
    let id = handle
        .submit_process("c", "stubborn-run", None, 1)
        .await
        .expect("submit");
    handle.start(vec![id]).await.expect("start");
    wait_until_running(&handle, id, "incubate").await;

    handle.cancel(Scope::Process(id)).await.expect("cancel");
    let report = wait_for(&handle, secs(20), |r| terminal(r, id)).await;
    assert_eq!(process(&report, id).state, ProcessState::Cancelled);

    // The device refused the cancel: the incubation finished and its
    // side effects committed, but nothing after it ran.
    // Give the stubborn adapter time to finish and commit.
    tokio::time::sleep(secs(4)).await;
    let steps = backend.load_steps().await.expect("history");
    let incubate = steps.iter().find(|s| s.step_name == "incubate");
    assert!(incubate.is_some_and(|s| s.status == StepStatus::Ok));
    assert_eq!(steps.iter().filter(|s| s.movement.is_some()).count(), 1);
}

// ---------------------------------------------------------------------
// Scenario: re-plan on delay
// ---------------------------------------------------------------------

fn overrunning_graph() -> WorkflowGraph {
    let mut b = GraphBuilder::new("slow-incubation");
    let plate = b.labware("P5", "Hotel", 0);
    let to_inc = b.movement(DeviceKind::Incubator, secs(5), "P5");
    let incubate = b.operation("incubate", DeviceKind::Incubator, secs(30), &["P5"]);
    if let Some(op) = b.operation_mut(incubate) {
        // Runs twice as long as scheduled, but under the timeout.
        op.params.insert("sim_extra_secs".into(), ParamValue::Float(20.0));
    }
    let to_reader = b.movement(DeviceKind::PlateReader, secs(5), "P5");
    let measure = b.operation("measure", DeviceKind::PlateReader, secs(5), &["P5"]);
    b.connect(plate, to_inc).container = Some("P5".into());
    b.connect(to_inc, incubate).container = Some("P5".into());
    b.connect(incubate, to_reader).container = Some("P5".into());
    b.connect(to_reader, measure).container = Some("P5".into());
    b.build().expect("valid graph")
}

#[tokio::test]
async fn test_replan_on_overrun() {
    let speed = 10.0;
    let (handle, backend) = launch(test_config(speed), vec![("slow", overrunning_graph())]);
    let id = handle
        .submit_process("slow", "slow-run", None, 1)
        .await
        .expect("submit");
    handle.start(vec![id]).await.expect("start");

    let report = wait_for(&handle, secs(30), |r| terminal(r, id)).await;
    assert_eq!(process(&report, id).state, ProcessState::Completed);

    let steps = backend.load_steps().await.expect("history");
    let incubate = steps
        .iter()
        .find(|s| s.step_name == "incubate")
        .expect("incubate record");
    // Ran well past its scheduled duration.
    assert!(incubate.elapsed() >= Duration::from_secs_f64(45.0 / speed));
    // Downstream steps were pushed behind the revised finish.
    let after = steps
        .iter()
        .filter(|s| s.movement.as_ref().is_some_and(|m| m.target_kind == DeviceKind::PlateReader))
        .map(|s| s.started)
        .next()
        .expect("second movement");
    assert!(after >= incubate.finished);
}

// ---------------------------------------------------------------------
// Timeout handling
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_timeout_fails_the_step_and_process() {
    let mut config = test_config(20.0);
    config.executor.deviation_slack_secs = 2.0;
    let mut b = GraphBuilder::new("hung-device");
    let plate = b.labware("P6", "Hotel", 0);
    let to_inc = b.movement(DeviceKind::Incubator, secs(2), "P6");
    let incubate = b.operation("incubate", DeviceKind::Incubator, secs(10), &["P6"]);
    if let Some(op) = b.operation_mut(incubate) {
        op.params.insert("sim_extra_secs".into(), ParamValue::Float(300.0));
    }
    b.connect(plate, to_inc).container = Some("P6".into());
    b.connect(to_inc, incubate).container = Some("P6".into());
    let graph = b.build().expect("valid graph");

    let (handle, _backend) = launch(config, vec![("hung", graph)]);
    let id = handle
        .submit_process("hung", "hung-run", None, 1)
        .await
        .expect("submit");
    handle.start(vec![id]).await.expect("start");

    let report = wait_for(&handle, secs(30), |r| terminal(r, id)).await;
    let p = process(&report, id);
    assert_eq!(p.state, ProcessState::Failed);
    let error = p.error.as_deref().expect("error reported");
    assert!(error.contains("timeout"), "error was: {}", error);
}

// ---------------------------------------------------------------------
// Pause / resume
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_global_pause_halts_dispatch() {
    let (handle, backend) = launch(test_config(30.0), vec![("linear", linear_graph())]);
    let id = handle
        .submit_process("linear", "paused-run", None, 1)
        .await
        .expect("submit");

    handle.pause(Scope::All).await.expect("pause");
    handle.start(vec![id]).await.expect("start");
    tokio::time::sleep(secs(2)).await;
    assert_eq!(
        backend.load_steps().await.expect("history").len(),
        0,
        "nothing dispatches while paused"
    );

    handle.resume(Scope::All).await.expect("resume");
    let report = wait_for(&handle, secs(30), |r| terminal(r, id)).await;
    assert_eq!(process(&report, id).state, ProcessState::Completed);
}

// ---------------------------------------------------------------------
// Two workflows share the fleet
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_two_workflows_share_the_reader() {
    fn read_graph(container: &str, slot: u32) -> WorkflowGraph {
        let mut b = GraphBuilder::new("shared-reader");
        let plate = b.labware(container, "Hotel", slot);
        let to_reader = b.movement(DeviceKind::PlateReader, secs(2), container);
        let measure = b.operation("measure", DeviceKind::PlateReader, secs(10), &[container]);
        let back = b.movement(DeviceKind::Storage, secs(2), container);
        b.connect(plate, to_reader).container = Some(container.to_string());
        b.connect(to_reader, measure).container = Some(container.to_string());
        b.connect(measure, back).container = Some(container.to_string());
        b.build().expect("valid graph")
    }

    let (handle, backend) = launch(
        test_config(20.0),
        vec![("a", read_graph("A", 0)), ("b", read_graph("B", 1))],
    );
    let first = handle.submit_process("a", "a", None, 1).await.expect("submit");
    let second = handle.submit_process("b", "b", None, 2).await.expect("submit");
    handle.start(vec![first, second]).await.expect("start");

    let report = wait_for(&handle, secs(40), |r| {
        terminal(r, first) && terminal(r, second)
    })
    .await;
    assert_eq!(process(&report, first).state, ProcessState::Completed);
    assert_eq!(process(&report, second).state, ProcessState::Completed);

    // The single reader serialized the two measurements.
    let steps = backend.load_steps().await.expect("history");
    let mut reads: Vec<_> = steps.iter().filter(|s| s.step_name == "measure").collect();
    assert_eq!(reads.len(), 2);
    reads.sort_by_key(|s| s.started);
    assert!(reads[1].started >= reads[0].finished);
}
