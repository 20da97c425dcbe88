//! Core identifiers and data types shared across the orchestrator.
//!
//! Everything that moves between subsystems lives here: stable integer ids
//! (devices, containers, processes, graph nodes, steps), the device-kind
//! taxonomy, physical positions, and the `ParamValue` bag used for operation
//! parameters and runtime values.
//!
//! # Id scheme
//!
//! All cross-references between subsystems are by value through these ids.
//! Devices and containers are indices into the status store's flat vectors;
//! [`NodeId`] is local to one workflow graph; [`StepId`] is globally unique
//! across every submitted process. No component holds a pointer back into
//! another component's state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Index of a device in the lab catalogue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Index of a container in the status store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub u32);

/// Identifier of one submitted process (workflow execution).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub u32);

/// Node index local to one workflow graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Globally unique step id across all live processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// The device taxonomy of the lab.
///
/// Every device in the catalogue belongs to exactly one kind; operations in a
/// workflow graph request a kind, and the scheduler picks a concrete device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Incubator,
    PlateReader,
    LiquidHandler,
    Mover,
    Centrifuge,
    Storage,
}

impl DeviceKind {
    /// Maps a configuration section name (`incubators`, `plate_readers`, ...)
    /// to its kind. Returns `None` for unrecognized sections.
    pub fn from_section(section: &str) -> Option<Self> {
        match section {
            "incubators" => Some(DeviceKind::Incubator),
            "plate_readers" => Some(DeviceKind::PlateReader),
            "liquid_handlers" => Some(DeviceKind::LiquidHandler),
            "movers" => Some(DeviceKind::Mover),
            "centrifuges" => Some(DeviceKind::Centrifuge),
            "storage" => Some(DeviceKind::Storage),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Incubator => "incubator",
            DeviceKind::PlateReader => "plate_reader",
            DeviceKind::LiquidHandler => "liquid_handler",
            DeviceKind::Mover => "mover",
            DeviceKind::Centrifuge => "centrifuge",
            DeviceKind::Storage => "storage",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical slot on a device.
///
/// Positions uniquely identify a location in the lab. Containers and parked
/// lids share the position namespace: a position is empty only when it holds
/// neither.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub device: DeviceId,
    pub slot: u32,
}

impl Position {
    pub fn new(device: DeviceId, slot: u32) -> Self {
        Self { device, slot }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.device, self.slot)
    }
}

/// Strongly-typed parameter and runtime value.
///
/// Operation payloads are explicit key/value bags of these; the same type
/// carries runtime values produced by operations (measurement results,
/// computed quantities, branch inputs).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    FloatArray(Vec<f64>),
    Null,
}

/// Parameter bag attached to an operation.
pub type Params = HashMap<String, ParamValue>;

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(f) => Some(*f),
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            ParamValue::Float(f) => Some(*f as i64),
            ParamValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            ParamValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::String(s) => write!(f, "{}", s),
            ParamValue::FloatArray(xs) => write!(f, "{:?}", xs),
            ParamValue::Null => write!(f, "null"),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::Int(value as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(value: Vec<f64>) -> Self {
        ParamValue::FloatArray(value)
    }
}

/// Canonical textual form of a parameter bag, stable across key order.
///
/// Used to decide compatibility when bundling operations on devices with a
/// minimum occupancy (same function + same parameters may share a run).
pub fn canonical_params(params: &Params) -> String {
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();
    let mut out = String::new();
    for k in keys {
        out.push_str(k);
        out.push('=');
        out.push_str(&params[k].to_string());
        out.push(';');
    }
    out
}
