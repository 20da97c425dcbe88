//! Status-store round-trips and journal write-through.

use labflow::config::LabConfig;
use labflow::core::{DeviceKind, Position};
use labflow::store::persistence::{Journal, MemoryBackend, StorageBackend};
use labflow::store::{ContainerSpec, StatusStore};
use labflow::store::history::{HistoryRecord, StepStatus};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const LAB_DOC: &str = r#"
description: store test lab
devices:
  storage:
    Hotel:
      capacity: 4
  incubators:
    Inc:
      capacity: 2
"#;

fn lab() -> StatusStore {
    StatusStore::new(&LabConfig::from_document(LAB_DOC).expect("doc").catalogue())
}

#[test]
fn test_add_then_remove_roundtrip() {
    let mut store = lab();
    let before: Vec<bool> = (0..4)
        .map(|slot| {
            store.position_empty(Position::new(store.device_by_name("Hotel").unwrap().id, slot))
        })
        .collect();

    let id = store
        .add_container(ContainerSpec {
            device: "Hotel".into(),
            slot: Some(2),
            lidded: true,
            ..ContainerSpec::default()
        })
        .expect("add");
    store.remove_container(id).expect("remove");

    // Device state is unchanged; the container row survives as removed.
    let after: Vec<bool> = (0..4)
        .map(|slot| {
            store.position_empty(Position::new(store.device_by_name("Hotel").unwrap().id, slot))
        })
        .collect();
    assert_eq!(before, after);
    assert!(store.container(id).expect("row kept").removed);
    assert!(store
        .containers()
        .all(|c| c.id != id), "removed container hidden from live set");
}

#[test]
fn test_unlid_lid_restores_exactly() {
    let mut store = lab();
    let id = store
        .add_container(ContainerSpec {
            device: "Hotel".into(),
            slot: Some(0),
            lidded: true,
            ..ContainerSpec::default()
        })
        .expect("add");
    let hotel = store.device_by_name("Hotel").unwrap().id;
    let park = Position::new(hotel, 3);

    store.unlid(id, park).expect("unlid");
    store.lid(id, Some(park)).expect("lid");

    let container = store.container(id).unwrap();
    assert!(container.lidded);
    assert_eq!(container.lid_pos, None);
    assert!(store.position_empty(park));
}

#[test]
fn test_wipe_lab_keeps_catalogue() {
    let mut store = lab();
    store
        .add_container(ContainerSpec {
            device: "Inc".into(),
            slot: Some(0),
            ..ContainerSpec::default()
        })
        .expect("add");
    store.record_step(HistoryRecord {
        experiment: Uuid::new_v4(),
        step_name: "incubate".into(),
        device: "Inc".into(),
        device_kind: DeviceKind::Incubator,
        containers: vec![],
        started: Utc::now(),
        finished: Utc::now(),
        status: StepStatus::Ok,
        value: None,
        params: Default::default(),
        movement: None,
        is_simulation: false,
    });
    store.wipe_lab();
    assert_eq!(store.containers().count(), 0);
    assert!(store.history().is_empty());
    assert_eq!(store.devices().len(), 2);
}

#[tokio::test]
async fn test_journal_write_through() {
    let backend = Arc::new(MemoryBackend::new());
    let (journal, writer) = Journal::spawn(Box::new(Arc::clone(&backend)));
    let mut store = lab().with_journal(journal);

    let id = store
        .add_container(ContainerSpec {
            device: "Hotel".into(),
            slot: Some(0),
            barcode: Some("BC-77".into()),
            ..ContainerSpec::default()
        })
        .expect("add");
    let hotel = store.device_by_name("Hotel").unwrap().id;
    let inc = store.device_by_name("Inc").unwrap().id;
    store
        .move_container(Position::new(hotel, 0), Position::new(inc, 1), Some("BC-77"))
        .expect("move");
    store.record_step(HistoryRecord {
        experiment: Uuid::new_v4(),
        step_name: "incubate".into(),
        device: "Inc".into(),
        device_kind: DeviceKind::Incubator,
        containers: vec![id],
        started: Utc::now(),
        finished: Utc::now() + chrono::TimeDelta::seconds(60),
        status: StepStatus::Ok,
        value: None,
        params: Default::default(),
        movement: None,
        is_simulation: false,
    });

    // Dropping the store closes the journal; the writer drains first.
    drop(store);
    tokio::time::timeout(Duration::from_secs(2), writer)
        .await
        .expect("writer drained")
        .expect("writer task");

    let rows = backend.container_rows();
    let last = rows.last().expect("container journaled");
    assert_eq!(last.current_pos, Position::new(inc, 1));
    assert_eq!(backend.step_count(), 1);
    let steps = backend.load_steps().await.expect("steps");
    assert_eq!(steps[0].step_name, "incubate");
}
