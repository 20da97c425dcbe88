//! Pluggable persistence for status-store state and step history.
//!
//! The in-memory store is the atomicity boundary; the backend is a journal
//! written after each in-memory commit. A backend failure is logged and
//! surfaced, it never corrupts live state.
//!
//! Two backends ship with the crate: [`MemoryBackend`] (default, tests) and
//! [`JsonlBackend`] (append-only JSON-lines files under a data directory).

use crate::core::ProcessId;
use crate::error::{LabError, LabResult};
use crate::store::history::HistoryRecord;
use crate::store::{Container, Device};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Persisted row for one process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessRow {
    pub id: ProcessId,
    pub name: String,
    pub state: String,
    pub experiment: Uuid,
}

/// Persisted row for one experiment (one workflow execution).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentRow {
    pub uuid: Uuid,
    pub process_name: String,
    pub started: DateTime<Utc>,
}

/// A per-device certificate (calibration, service record).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceCertificate {
    pub device: String,
    pub name: String,
    pub issued: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Storage back end for container state and step history.
///
/// Implementations must tolerate repeated upserts for the same entity;
/// step records are strictly append-only.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn put_device(&self, device: &Device) -> LabResult<()>;
    async fn put_container(&self, container: &Container) -> LabResult<()>;
    async fn put_process(&self, process: &ProcessRow) -> LabResult<()>;
    async fn put_experiment(&self, experiment: &ExperimentRow) -> LabResult<()>;
    async fn append_step(&self, record: &HistoryRecord) -> LabResult<()>;
    async fn put_certificate(&self, certificate: &DeviceCertificate) -> LabResult<()>;
    /// Reads back all persisted step records, oldest first.
    async fn load_steps(&self) -> LabResult<Vec<HistoryRecord>>;
}

/// In-memory backend; the default when no data directory is configured.
#[derive(Default)]
pub struct MemoryBackend {
    devices: Mutex<Vec<Device>>,
    containers: Mutex<Vec<Container>>,
    processes: Mutex<Vec<ProcessRow>>,
    experiments: Mutex<Vec<ExperimentRow>>,
    steps: Mutex<Vec<HistoryRecord>>,
    certificates: Mutex<Vec<DeviceCertificate>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step_count(&self) -> usize {
        self.steps.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn process_rows(&self) -> Vec<ProcessRow> {
        self.processes.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn container_rows(&self) -> Vec<Container> {
        self.containers.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

// A shared backend handle is itself a backend; lets callers keep a reader
// side while the journal writer owns the other.
#[async_trait]
impl<T: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<T> {
    async fn put_device(&self, device: &Device) -> LabResult<()> {
        (**self).put_device(device).await
    }

    async fn put_container(&self, container: &Container) -> LabResult<()> {
        (**self).put_container(container).await
    }

    async fn put_process(&self, process: &ProcessRow) -> LabResult<()> {
        (**self).put_process(process).await
    }

    async fn put_experiment(&self, experiment: &ExperimentRow) -> LabResult<()> {
        (**self).put_experiment(experiment).await
    }

    async fn append_step(&self, record: &HistoryRecord) -> LabResult<()> {
        (**self).append_step(record).await
    }

    async fn put_certificate(&self, certificate: &DeviceCertificate) -> LabResult<()> {
        (**self).put_certificate(certificate).await
    }

    async fn load_steps(&self) -> LabResult<Vec<HistoryRecord>> {
        (**self).load_steps().await
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put_device(&self, device: &Device) -> LabResult<()> {
        let mut rows = self
            .devices
            .lock()
            .map_err(|_| LabError::Persist("device table poisoned".into()))?;
        if let Some(row) = rows.iter_mut().find(|d| d.name == device.name) {
            *row = device.clone();
        } else {
            rows.push(device.clone());
        }
        Ok(())
    }

    async fn put_container(&self, container: &Container) -> LabResult<()> {
        let mut rows = self
            .containers
            .lock()
            .map_err(|_| LabError::Persist("container table poisoned".into()))?;
        if let Some(row) = rows.iter_mut().find(|c| c.id == container.id) {
            *row = container.clone();
        } else {
            rows.push(container.clone());
        }
        Ok(())
    }

    async fn put_process(&self, process: &ProcessRow) -> LabResult<()> {
        let mut rows = self
            .processes
            .lock()
            .map_err(|_| LabError::Persist("process table poisoned".into()))?;
        if let Some(row) = rows.iter_mut().find(|p| p.id == process.id) {
            *row = process.clone();
        } else {
            rows.push(process.clone());
        }
        Ok(())
    }

    async fn put_experiment(&self, experiment: &ExperimentRow) -> LabResult<()> {
        let mut rows = self
            .experiments
            .lock()
            .map_err(|_| LabError::Persist("experiment table poisoned".into()))?;
        if rows.iter().all(|e| e.uuid != experiment.uuid) {
            rows.push(experiment.clone());
        }
        Ok(())
    }

    async fn append_step(&self, record: &HistoryRecord) -> LabResult<()> {
        self.steps
            .lock()
            .map_err(|_| LabError::Persist("step table poisoned".into()))?
            .push(record.clone());
        Ok(())
    }

    async fn put_certificate(&self, certificate: &DeviceCertificate) -> LabResult<()> {
        self.certificates
            .lock()
            .map_err(|_| LabError::Persist("certificate table poisoned".into()))?
            .push(certificate.clone());
        Ok(())
    }

    async fn load_steps(&self) -> LabResult<Vec<HistoryRecord>> {
        Ok(self
            .steps
            .lock()
            .map_err(|_| LabError::Persist("step table poisoned".into()))?
            .clone())
    }
}

/// Append-only JSON-lines files under a data directory, one per record class.
pub struct JsonlBackend {
    dir: PathBuf,
}

impl JsonlBackend {
    pub fn new(dir: PathBuf) -> LabResult<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn append<T: Serialize>(&self, file: &str, value: &T) -> LabResult<()> {
        let line = serde_json::to_string(value)
            .map_err(|e| LabError::Persist(format!("serialize {}: {}", file, e)))?;
        let path = self.dir.join(file);
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        f.write_all(line.as_bytes())?;
        f.write_all(b"\n")?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for JsonlBackend {
    async fn put_device(&self, device: &Device) -> LabResult<()> {
        self.append("devices.jsonl", device)
    }

    async fn put_container(&self, container: &Container) -> LabResult<()> {
        self.append("containers.jsonl", container)
    }

    async fn put_process(&self, process: &ProcessRow) -> LabResult<()> {
        self.append("processes.jsonl", process)
    }

    async fn put_experiment(&self, experiment: &ExperimentRow) -> LabResult<()> {
        self.append("experiments.jsonl", experiment)
    }

    async fn append_step(&self, record: &HistoryRecord) -> LabResult<()> {
        self.append("steps.jsonl", record)
    }

    async fn put_certificate(&self, certificate: &DeviceCertificate) -> LabResult<()> {
        self.append("certificates.jsonl", certificate)
    }

    async fn load_steps(&self) -> LabResult<Vec<HistoryRecord>> {
        let path = self.dir.join("steps.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path)?;
        let mut records = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<HistoryRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping unreadable history line"),
            }
        }
        Ok(records)
    }
}

/// Event routed from the store to the journal writer task.
#[derive(Clone, Debug)]
pub enum JournalEvent {
    Device(Device),
    Container(Container),
    Process(ProcessRow),
    Experiment(ExperimentRow),
    Step(HistoryRecord),
    Certificate(DeviceCertificate),
}

/// Handle through which the store emits journal events.
///
/// Cloneable; dropping all clones shuts the writer task down once its queue
/// drains.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::UnboundedSender<JournalEvent>,
}

impl Journal {
    /// Spawns the writer task over the given backend.
    pub fn spawn(backend: Box<dyn StorageBackend>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<JournalEvent>();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = match &event {
                    JournalEvent::Device(d) => backend.put_device(d).await,
                    JournalEvent::Container(c) => backend.put_container(c).await,
                    JournalEvent::Process(p) => backend.put_process(p).await,
                    JournalEvent::Experiment(e) => backend.put_experiment(e).await,
                    JournalEvent::Step(s) => backend.append_step(s).await,
                    JournalEvent::Certificate(c) => backend.put_certificate(c).await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "journal write failed; record not durable");
                }
            }
            debug!("journal writer drained");
        });
        (Self { tx }, task)
    }

    pub fn record(&self, event: JournalEvent) {
        // The writer outlives all senders, so failure here means shutdown.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ContainerId, DeviceId, DeviceKind, Params, Position};
    use crate::store::history::StepStatus;

    fn record() -> HistoryRecord {
        HistoryRecord {
            experiment: Uuid::new_v4(),
            step_name: "incubate".into(),
            device: "Incubator1".into(),
            device_kind: DeviceKind::Incubator,
            containers: vec![ContainerId(1)],
            started: Utc::now(),
            finished: Utc::now(),
            status: StepStatus::Ok,
            value: None,
            params: Params::new(),
            movement: None,
            is_simulation: false,
        }
    }

    #[tokio::test]
    async fn test_jsonl_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = JsonlBackend::new(dir.path().to_path_buf()).expect("backend");
        backend.append_step(&record()).await.expect("append");
        backend.append_step(&record()).await.expect("append");
        let steps = backend.load_steps().await.expect("load");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_name, "incubate");
    }

    #[tokio::test]
    async fn test_memory_backend_upserts_containers() {
        let backend = MemoryBackend::new();
        let mut container = Container {
            id: ContainerId(0),
            barcode: None,
            current_pos: Position::new(DeviceId(0), 0),
            starting_pos: Position::new(DeviceId(0), 0),
            lidded: false,
            lid_pos: None,
            removed: false,
            labware_type: None,
            deep_well: false,
        };
        backend.put_container(&container).await.expect("put");
        container.lidded = true;
        backend.put_container(&container).await.expect("put");
        let rows = backend.containers.lock().expect("lock");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].lidded);
    }
}
