//! Authoritative status store: devices, positions, containers, lids, history.
//!
//! The store is the single source of truth for "where is everything". Every
//! mutation validates the full set of invariants first and only then applies
//! the change; a rejected operation leaves no trace. Invariants held here:
//!
//! - at most one occupant (container or parked lid) per position;
//! - `removed` containers are excluded from all position lookups;
//! - `lid_pos` is non-null iff the container is unlidded with a parked lid;
//! - `current_pos` always points at a valid slot of an existing device.
//!
//! The store is a synchronous state machine owned by the core loop; durable
//! persistence happens through the [`persistence::Journal`] writer task after
//! each in-memory commit.

pub mod history;
pub mod persistence;

use crate::config::DeviceSpec;
use crate::core::{ContainerId, DeviceId, DeviceKind, Position};
use crate::error::StateConflict;
use crate::estimator::{DurationEstimator, EstimateKey};
use crate::store::history::HistoryRecord;
use crate::store::persistence::{DeviceCertificate, Journal, JournalEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// A physical device of the lab fleet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub kind: DeviceKind,
    /// Maximum containers resident at once.
    pub capacity: u32,
    /// Maximum concurrent operations.
    pub process_capacity: u32,
    /// Minimum occupancy required to operate.
    pub min_capacity: u32,
    /// Whether two operations may overlap in time.
    pub allows_overlap: bool,
    /// Slots suited for deep-well labware; `None` means all of them.
    deep_well_slots: Option<Vec<u32>>,
}

impl Device {
    fn from_spec(id: DeviceId, spec: &DeviceSpec) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            kind: spec.kind,
            capacity: spec.capacity,
            process_capacity: spec.process_capacity,
            min_capacity: spec.min_capacity,
            allows_overlap: spec.allows_overlap,
            deep_well_slots: spec.deep_well_slots.clone(),
        }
    }

    /// Whether a slot can take deep-well labware.
    pub fn deep_well_suited(&self, slot: u32) -> bool {
        match &self.deep_well_slots {
            Some(slots) => slots.contains(&slot),
            None => true,
        }
    }

    pub fn has_slot(&self, slot: u32) -> bool {
        slot < self.capacity
    }
}

/// A tracked labware item (plate, tube).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub barcode: Option<String>,
    pub current_pos: Position,
    pub starting_pos: Position,
    pub lidded: bool,
    /// Set iff `lidded == false` and the lid is parked somewhere.
    pub lid_pos: Option<Position>,
    pub removed: bool,
    pub labware_type: Option<String>,
    pub deep_well: bool,
}

/// Request to register a new container in the lab.
#[derive(Clone, Debug, Default)]
pub struct ContainerSpec {
    pub barcode: Option<String>,
    /// Target device by name.
    pub device: String,
    /// Explicit slot; `None` picks the first free compatible slot.
    pub slot: Option<u32>,
    pub lidded: bool,
    pub labware_type: Option<String>,
    pub deep_well: bool,
}

/// What occupies a position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Occupant {
    Container(ContainerId),
    /// A parked lid, keyed by the container it belongs to.
    Lid(ContainerId),
}

pub struct StatusStore {
    devices: Vec<Device>,
    device_names: HashMap<String, DeviceId>,
    containers: Vec<Container>,
    barcodes: HashMap<String, ContainerId>,
    occupancy: HashMap<Position, Occupant>,
    history: Vec<HistoryRecord>,
    journal: Option<Journal>,
}

impl StatusStore {
    pub fn new(catalogue: &[DeviceSpec]) -> Self {
        let devices: Vec<Device> = catalogue
            .iter()
            .enumerate()
            .map(|(i, spec)| Device::from_spec(DeviceId(i as u32), spec))
            .collect();
        let device_names = devices
            .iter()
            .map(|d| (d.name.clone(), d.id))
            .collect();
        Self {
            devices,
            device_names,
            containers: Vec::new(),
            barcodes: HashMap::new(),
            occupancy: HashMap::new(),
            history: Vec::new(),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self.journal_catalogue();
        self
    }

    /// Seeds the in-memory history, e.g. from a persisted journal.
    pub fn preload_history(&mut self, records: Vec<HistoryRecord>) {
        self.history = records;
    }

    // ------------------------------------------------------------------
    // Catalogue
    // ------------------------------------------------------------------

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id.0 as usize)
    }

    pub fn device_by_name(&self, name: &str) -> Option<&Device> {
        self.device_names.get(name).and_then(|id| self.device(*id))
    }

    pub fn device_name(&self, id: DeviceId) -> &str {
        self.device(id).map(|d| d.name.as_str()).unwrap_or("?")
    }

    /// Replaces the device catalogue.
    ///
    /// Rejected while any live container (or parked lid) sits on a position
    /// that does not exist in the new catalogue; surviving occupancy is
    /// re-seated by device name.
    pub fn configure(&mut self, catalogue: &[DeviceSpec]) -> Result<(), StateConflict> {
        let new_devices: Vec<Device> = catalogue
            .iter()
            .enumerate()
            .map(|(i, spec)| Device::from_spec(DeviceId(i as u32), spec))
            .collect();
        let new_names: HashMap<String, DeviceId> = new_devices
            .iter()
            .map(|d| (d.name.clone(), d.id))
            .collect();

        // Validate every live position against the new catalogue first.
        let mut remap = |pos: Position| -> Result<Position, StateConflict> {
            let old_name = self.device_name(pos.device).to_string();
            let new_id = new_names
                .get(&old_name)
                .copied()
                .ok_or(StateConflict::CatalogueMismatch(format!(
                    "device {} no longer exists",
                    old_name
                )))?;
            let device = &new_devices[new_id.0 as usize];
            if !device.has_slot(pos.slot) {
                return Err(StateConflict::CatalogueMismatch(format!(
                    "slot {} no longer exists on {}",
                    pos.slot, old_name
                )));
            }
            Ok(Position::new(new_id, pos.slot))
        };

        let mut moved_containers = Vec::new();
        for container in self.containers.iter().filter(|c| !c.removed) {
            let current = remap(container.current_pos)?;
            let lid = container.lid_pos.map(&mut remap).transpose()?;
            moved_containers.push((container.id, current, lid));
        }

        // All positions survive; apply the new catalogue.
        self.devices = new_devices;
        self.device_names = new_names;
        self.occupancy.clear();
        for (id, current, lid) in moved_containers {
            let container = &mut self.containers[id.0 as usize];
            container.current_pos = current;
            container.lid_pos = lid;
            self.occupancy.insert(current, Occupant::Container(id));
            if let Some(lid_pos) = lid {
                self.occupancy.insert(lid_pos, Occupant::Lid(id));
            }
        }
        info!(devices = self.devices.len(), "lab catalogue replaced");
        self.journal_catalogue();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn position_empty(&self, pos: Position) -> bool {
        !self.occupancy.contains_key(&pos)
    }

    pub fn container_at(&self, pos: Position) -> Option<&Container> {
        match self.occupancy.get(&pos) {
            Some(Occupant::Container(id)) => self.container(*id),
            _ => None,
        }
    }

    pub fn container(&self, id: ContainerId) -> Option<&Container> {
        self.containers.get(id.0 as usize)
    }

    pub fn container_by_barcode(&self, barcode: &str) -> Option<&Container> {
        self.barcodes
            .get(barcode)
            .and_then(|id| self.container(*id))
            .filter(|c| !c.removed)
    }

    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.containers.iter().filter(|c| !c.removed)
    }

    /// First empty slot on a device passing the deep-well filter.
    pub fn free_slot(&self, device: DeviceId, deep_well: bool) -> Option<u32> {
        let dev = self.device(device)?;
        (0..dev.capacity).find(|slot| {
            let pos = Position::new(device, *slot);
            self.position_empty(pos) && (!deep_well || dev.deep_well_suited(*slot))
        })
    }

    /// Number of live containers currently resident on a device.
    pub fn resident_count(&self, device: DeviceId) -> u32 {
        self.containers
            .iter()
            .filter(|c| !c.removed && c.current_pos.device == device)
            .count() as u32
    }

    fn resolve_position(&self, pos: Position) -> Result<(), StateConflict> {
        let device = self
            .device(pos.device)
            .ok_or_else(|| StateConflict::UnknownDevice(pos.device.to_string()))?;
        if !device.has_slot(pos.slot) {
            return Err(StateConflict::InvalidSlot(pos));
        }
        Ok(())
    }

    fn live_container(&self, id: ContainerId) -> Result<&Container, StateConflict> {
        let container = self
            .container(id)
            .ok_or(StateConflict::UnknownContainer(id))?;
        if container.removed {
            return Err(StateConflict::ContainerRemoved(id));
        }
        Ok(container)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Registers a new container at its starting position.
    pub fn add_container(&mut self, spec: ContainerSpec) -> Result<ContainerId, StateConflict> {
        let device = self
            .device_by_name(&spec.device)
            .ok_or_else(|| StateConflict::UnknownDevice(spec.device.clone()))?;
        let device_id = device.id;

        let slot = match spec.slot {
            Some(slot) => {
                let pos = Position::new(device_id, slot);
                if !device.has_slot(slot) {
                    return Err(StateConflict::InvalidSlot(pos));
                }
                if spec.deep_well && !device.deep_well_suited(slot) {
                    return Err(StateConflict::DeepWellUnsuited(pos));
                }
                if !self.position_empty(pos) {
                    return Err(StateConflict::PositionOccupied(pos));
                }
                slot
            }
            None => self
                .free_slot(device_id, spec.deep_well)
                .ok_or_else(|| StateConflict::DeviceFull(spec.device.clone()))?,
        };

        if let Some(barcode) = &spec.barcode {
            if self.container_by_barcode(barcode).is_some() {
                return Err(StateConflict::BarcodeTaken(barcode.clone()));
            }
        }

        let id = ContainerId(self.containers.len() as u32);
        let pos = Position::new(device_id, slot);
        let container = Container {
            id,
            barcode: spec.barcode.clone(),
            current_pos: pos,
            starting_pos: pos,
            lidded: spec.lidded,
            lid_pos: None,
            removed: false,
            labware_type: spec.labware_type,
            deep_well: spec.deep_well,
        };
        self.occupancy.insert(pos, Occupant::Container(id));
        if let Some(barcode) = spec.barcode {
            self.barcodes.insert(barcode, id);
        }
        debug!(container = %id, position = %pos, "container added");
        self.containers.push(container);
        self.journal_container(id);
        Ok(id)
    }

    /// Moves a container from one position to another, atomically.
    ///
    /// When a barcode is supplied, it must both match the container at the
    /// source and not identify a different container elsewhere.
    pub fn move_container(
        &mut self,
        src: Position,
        dst: Position,
        barcode: Option<&str>,
    ) -> Result<(), StateConflict> {
        self.resolve_position(src)?;
        self.resolve_position(dst)?;

        let container_id = match self.occupancy.get(&src) {
            Some(Occupant::Container(id)) => *id,
            _ => return Err(StateConflict::SourceEmpty(src)),
        };

        if let Some(expected) = barcode {
            if let Some(other) = self.container_by_barcode(expected) {
                if other.id != container_id {
                    return Err(StateConflict::AmbiguousSource {
                        position: src,
                        barcode: expected.to_string(),
                    });
                }
            }
            let found = self.containers[container_id.0 as usize].barcode.clone();
            if found.as_deref() != Some(expected) {
                return Err(StateConflict::BarcodeMismatch {
                    position: src,
                    expected: expected.to_string(),
                    found,
                });
            }
        }

        if !self.position_empty(dst) {
            return Err(StateConflict::DestOccupied(dst));
        }
        let container = &self.containers[container_id.0 as usize];
        let dst_device = &self.devices[dst.device.0 as usize];
        if container.deep_well && !dst_device.deep_well_suited(dst.slot) {
            return Err(StateConflict::DeepWellUnsuited(dst));
        }

        self.occupancy.remove(&src);
        self.occupancy.insert(dst, Occupant::Container(container_id));
        self.containers[container_id.0 as usize].current_pos = dst;
        debug!(container = %container_id, from = %src, to = %dst, "container moved");
        self.journal_container(container_id);
        Ok(())
    }

    /// Takes the lid off a container and parks it at the given position.
    pub fn unlid(&mut self, id: ContainerId, lid_pos: Position) -> Result<(), StateConflict> {
        self.resolve_position(lid_pos)?;
        let container = self.live_container(id)?;
        if !container.lidded {
            return Err(StateConflict::NotLidded(id));
        }
        if !self.position_empty(lid_pos) {
            return Err(StateConflict::PositionOccupied(lid_pos));
        }
        let container = &mut self.containers[id.0 as usize];
        container.lidded = false;
        container.lid_pos = Some(lid_pos);
        self.occupancy.insert(lid_pos, Occupant::Lid(id));
        debug!(container = %id, lid = %lid_pos, "lid parked");
        self.journal_container(id);
        Ok(())
    }

    /// Puts the lid back on a container.
    ///
    /// When a position is supplied, the lid must actually be parked there.
    pub fn lid(&mut self, id: ContainerId, expect: Option<Position>) -> Result<(), StateConflict> {
        let container = self.live_container(id)?;
        if container.lidded {
            return Err(StateConflict::AlreadyLidded(id));
        }
        let lid_pos = container.lid_pos.ok_or(StateConflict::NotLidded(id))?;
        if let Some(expected) = expect {
            if expected != lid_pos {
                return Err(StateConflict::LidNotAt {
                    container: id,
                    position: expected,
                });
            }
        }
        self.occupancy.remove(&lid_pos);
        let container = &mut self.containers[id.0 as usize];
        container.lidded = true;
        container.lid_pos = None;
        debug!(container = %id, "lid restored");
        self.journal_container(id);
        Ok(())
    }

    /// Assigns a barcode; collisions with any live container are rejected.
    pub fn set_barcode(&mut self, id: ContainerId, barcode: String) -> Result<(), StateConflict> {
        self.live_container(id)?;
        if let Some(other) = self.container_by_barcode(&barcode) {
            if other.id != id {
                return Err(StateConflict::BarcodeTaken(barcode));
            }
            return Ok(());
        }
        if let Some(old) = self.containers[id.0 as usize].barcode.take() {
            self.barcodes.remove(&old);
        }
        self.containers[id.0 as usize].barcode = Some(barcode.clone());
        self.barcodes.insert(barcode, id);
        self.journal_container(id);
        Ok(())
    }

    /// Unloads a container from the lab.
    ///
    /// The row stays (history is append-only); its positions are vacated and
    /// it is excluded from all future lookups.
    pub fn remove_container(&mut self, id: ContainerId) -> Result<(), StateConflict> {
        let container = self.live_container(id)?;
        let current = container.current_pos;
        let lid = container.lid_pos;
        self.occupancy.remove(&current);
        if let Some(lid_pos) = lid {
            self.occupancy.remove(&lid_pos);
        }
        let container = &mut self.containers[id.0 as usize];
        container.removed = true;
        container.lid_pos = None;
        debug!(container = %id, "container removed");
        self.journal_container(id);
        Ok(())
    }

    /// Clears all containers and history; the catalogue survives.
    pub fn wipe_lab(&mut self) {
        self.containers.clear();
        self.barcodes.clear();
        self.occupancy.clear();
        self.history.clear();
        info!("lab wiped");
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Persists a device certificate (calibration, service record).
    pub fn record_certificate(
        &mut self,
        device: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), StateConflict> {
        self.device_by_name(device)
            .ok_or_else(|| StateConflict::UnknownDevice(device.to_string()))?;
        if let Some(journal) = &self.journal {
            journal.record(JournalEvent::Certificate(DeviceCertificate {
                device: device.to_string(),
                name: name.to_string(),
                issued: chrono::Utc::now(),
                payload,
            }));
        }
        Ok(())
    }

    /// Appends a step record and journals it.
    pub fn record_step(&mut self, record: HistoryRecord) {
        if let Some(journal) = &self.journal {
            journal.record(JournalEvent::Step(record.clone()));
        }
        self.history.push(record);
    }

    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    /// Estimated duration for a step template, from comparable history.
    pub fn estimate_duration(
        &self,
        estimator: &DurationEstimator,
        key: &EstimateKey<'_>,
    ) -> Option<Duration> {
        estimator.estimate(&self.history, key)
    }

    pub(crate) fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    fn journal_container(&self, id: ContainerId) {
        if let (Some(journal), Some(container)) = (&self.journal, self.container(id)) {
            journal.record(JournalEvent::Container(container.clone()));
        }
    }

    fn journal_catalogue(&self) {
        if let Some(journal) = &self.journal {
            for device in &self.devices {
                journal.record(JournalEvent::Device(device.clone()));
            }
        }
    }
}
