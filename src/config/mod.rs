//! Configuration loading for the orchestrator.
//!
//! The lab configuration document is a hierarchical YAML file describing the
//! device fleet, plus application settings for the executor, scheduler,
//! duration estimator and simulation mode. Configuration is loaded from:
//!
//! 1. a YAML file (the lab document), and
//! 2. environment variables prefixed with `LABFLOW_`.
//!
//! # Example document
//!
//! ```yaml
//! description: QC line
//! devices:
//!   incubators:
//!     Incubator1:
//!       capacity: 20
//!       process_capacity: 4
//!   plate_readers:
//!     Reader:
//!       capacity: 1
//!   centrifuges:
//!     Spin1:
//!       capacity: 4
//!       min_capacity: 4
//!   storage:
//!     Hotel:
//!       capacity: 40
//!       allows_overlap: true
//! translation:
//!   incubators: IncubatorResource
//! ```
//!
//! Unknown device-kind sections are a configuration error, surfaced at load.

use crate::core::DeviceKind;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("unknown device kind section: {0}")]
    UnknownKind(String),

    #[error("duplicate device name: {0}")]
    DuplicateDevice(String),

    #[error("device {device}: {problem}")]
    InvalidDevice { device: String, problem: String },

    #[error("configuration validation error: {0}")]
    Validation(String),
}

/// One device entry inside a kind section of the lab document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Maximum number of containers resident at once.
    pub capacity: u32,
    /// Maximum number of concurrent operations; defaults to `capacity`.
    #[serde(default)]
    pub process_capacity: Option<u32>,
    /// Minimum occupancy required to operate (e.g. centrifuge balance).
    #[serde(default = "default_min_capacity")]
    pub min_capacity: u32,
    /// Whether two operations may overlap in time on this device.
    #[serde(default)]
    pub allows_overlap: bool,
    /// Slots suited for deep-well labware; absent means all slots are.
    #[serde(default)]
    pub deep_well_slots: Option<Vec<u32>>,
    /// Device-specific extra parameters, passed through to adapters.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_min_capacity() -> u32 {
    1
}

/// A device flattened out of the document, ready for the status store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: DeviceKind,
    pub capacity: u32,
    pub process_capacity: u32,
    pub min_capacity: u32,
    pub allows_overlap: bool,
    pub deep_well_slots: Option<Vec<u32>>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for the persistence journal; none disables journaling.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_app_name() -> String {
    "labflow".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Overrun beyond the scheduled duration that triggers a short re-plan.
    #[serde(default = "default_deviation_slack")]
    pub deviation_slack_secs: f64,
    /// Multiple of the expected duration after which a step times out.
    #[serde(default = "default_timeout_factor")]
    pub timeout_factor: f64,
    /// Grace period for a cooperative cancel before the step is written off.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: f64,
    /// Dispatch/watchdog poll interval.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Deadline after which a process that still cannot be planned is failed.
    #[serde(default = "default_unschedulable_deadline")]
    pub unschedulable_deadline_secs: f64,
}

fn default_deviation_slack() -> f64 {
    5.0
}

fn default_timeout_factor() -> f64 {
    2.0
}

fn default_cancel_grace() -> f64 {
    2.0
}

fn default_poll_interval() -> u64 {
    250
}

fn default_unschedulable_deadline() -> f64 {
    60.0
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            deviation_slack_secs: default_deviation_slack(),
            timeout_factor: default_timeout_factor(),
            cancel_grace_secs: default_cancel_grace(),
            poll_interval_ms: default_poll_interval(),
            unschedulable_deadline_secs: default_unschedulable_deadline(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Budget for local re-plans triggered by execution events.
    #[serde(default = "default_short_budget")]
    pub short_budget_ms: u64,
    /// Budget for full plans on submission or reset.
    #[serde(default = "default_long_budget")]
    pub long_budget_ms: u64,
}

fn default_short_budget() -> u64 {
    2_000
}

fn default_long_budget() -> u64 {
    15_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            short_budget_ms: default_short_budget(),
            long_budget_ms: default_long_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Confidence for the upper-confidence-bound duration estimate.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Minimum history samples before an estimate is trusted.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_confidence() -> f64 {
    0.95
}

fn default_min_samples() -> usize {
    5
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            confidence: default_confidence(),
            min_samples: default_min_samples(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Start with simulated adapters instead of real ones.
    #[serde(default)]
    pub enabled: bool,
    /// Acceleration factor for simulated operations.
    #[serde(default = "default_sim_speed")]
    pub speed: f64,
}

fn default_sim_speed() -> f64 {
    1.0
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            speed: default_sim_speed(),
        }
    }
}

/// Top-level configuration: the lab document plus application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabConfig {
    #[serde(default)]
    pub description: String,
    /// Kind section -> device name -> entry.
    #[serde(default)]
    pub devices: BTreeMap<String, BTreeMap<String, DeviceEntry>>,
    /// Kind section -> resource class name, consumed by the external parser.
    #[serde(default)]
    pub translation: BTreeMap<String, String>,
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl LabConfig {
    /// Loads configuration from a YAML file with `LABFLOW_` env overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: LabConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("LABFLOW_").split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a lab document from an in-memory YAML string.
    ///
    /// Used by `configure_lab` to replace the catalogue at runtime.
    pub fn from_document(document: &str) -> Result<Self, ConfigError> {
        let config: LabConfig = Figment::new()
            .merge(Yaml::string(document))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation beyond what deserialization enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for (section, entries) in &self.devices {
            let kind = DeviceKind::from_section(section)
                .ok_or_else(|| ConfigError::UnknownKind(section.clone()))?;
            for (name, entry) in entries {
                if !seen.insert(name.as_str()) {
                    return Err(ConfigError::DuplicateDevice(name.clone()));
                }
                // Capacity 0 is legal (the device exists but rejects all
                // work), so the occupancy floor only binds above zero.
                if entry.capacity > 0 && entry.min_capacity > entry.capacity {
                    return Err(ConfigError::InvalidDevice {
                        device: name.clone(),
                        problem: format!(
                            "min_capacity {} exceeds capacity {}",
                            entry.min_capacity, entry.capacity
                        ),
                    });
                }
                if let Some(slots) = &entry.deep_well_slots {
                    if let Some(bad) = slots.iter().find(|s| **s >= entry.capacity) {
                        return Err(ConfigError::InvalidDevice {
                            device: name.clone(),
                            problem: format!("deep_well slot {} outside capacity", bad),
                        });
                    }
                }
                let _ = kind;
            }
        }
        for section in self.translation.keys() {
            if DeviceKind::from_section(section).is_none() {
                return Err(ConfigError::UnknownKind(section.clone()));
            }
        }
        if self.estimator.confidence <= 0.0 || self.estimator.confidence >= 1.0 {
            return Err(ConfigError::Validation(format!(
                "estimator confidence {} outside (0, 1)",
                self.estimator.confidence
            )));
        }
        Ok(())
    }

    /// Flattens the device sections into an ordered catalogue.
    ///
    /// Order is deterministic (sections, then names, both sorted) so device
    /// ids are stable for a given document.
    pub fn catalogue(&self) -> Vec<DeviceSpec> {
        let mut specs = Vec::new();
        for (section, entries) in &self.devices {
            // validate() has already rejected unknown sections.
            let Some(kind) = DeviceKind::from_section(section) else {
                continue;
            };
            for (name, entry) in entries {
                specs.push(DeviceSpec {
                    name: name.clone(),
                    kind,
                    capacity: entry.capacity,
                    process_capacity: entry.process_capacity.unwrap_or(entry.capacity),
                    min_capacity: entry.min_capacity,
                    allows_overlap: entry.allows_overlap,
                    deep_well_slots: entry.deep_well_slots.clone(),
                    extra: entry.extra.clone(),
                });
            }
        }
        specs
    }
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            description: String::new(),
            devices: BTreeMap::new(),
            translation: BTreeMap::new(),
            application: ApplicationConfig::default(),
            executor: ExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
            estimator: EstimatorConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
description: QC line
devices:
  incubators:
    Incubator1:
      capacity: 20
      process_capacity: 4
  plate_readers:
    Reader:
      capacity: 1
  centrifuges:
    Spin1:
      capacity: 4
      min_capacity: 4
  storage:
    Hotel:
      capacity: 40
      allows_overlap: true
translation:
  incubators: IncubatorResource
"#;

    #[test]
    fn test_document_roundtrip() {
        let config = LabConfig::from_document(DOC).expect("valid document");
        assert_eq!(config.description, "QC line");
        let catalogue = config.catalogue();
        assert_eq!(catalogue.len(), 4);
        let spin = catalogue.iter().find(|d| d.name == "Spin1").unwrap();
        assert_eq!(spin.kind, DeviceKind::Centrifuge);
        assert_eq!(spin.min_capacity, 4);
        let incubator = catalogue.iter().find(|d| d.name == "Incubator1").unwrap();
        assert_eq!(incubator.process_capacity, 4);
        let hotel = catalogue.iter().find(|d| d.name == "Hotel").unwrap();
        assert!(hotel.allows_overlap);
        assert_eq!(hotel.process_capacity, 40);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let doc = "devices:\n  robots:\n    R2:\n      capacity: 1\n";
        let err = LabConfig::from_document(doc).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKind(k) if k == "robots"));
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let doc = concat!(
            "devices:\n",
            "  incubators:\n",
            "    Dup:\n",
            "      capacity: 1\n",
            "  storage:\n",
            "    Dup:\n",
            "      capacity: 1\n",
        );
        let err = LabConfig::from_document(doc).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateDevice(_)));
    }

    #[test]
    fn test_min_capacity_above_capacity_rejected() {
        let doc = "devices:\n  centrifuges:\n    C:\n      capacity: 2\n      min_capacity: 4\n";
        let err = LabConfig::from_document(doc).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDevice { .. }));
    }
}
