//! Duration estimation from step history.
//!
//! The estimator matches a step template against comparable past executions
//! and returns an upper-confidence-bound duration, so the scheduler plans
//! with durations that are rarely exceeded in practice. Matching, from most
//! to least specific:
//!
//! - movement steps: the (source kind, target kind) pair;
//! - operations: function name plus the full parameter bag;
//! - fallback: function name alone.
//!
//! Below the configured sample minimum the estimator returns `None` and the
//! caller falls back to the operation's declared expected duration.

use crate::config::EstimatorConfig;
use crate::core::{canonical_params, DeviceKind, Params};
use crate::store::history::{HistoryRecord, StepStatus};
use std::time::Duration;

/// How a step template is matched against history.
#[derive(Clone, Debug)]
pub enum EstimateKey<'a> {
    /// Movement between two device kinds.
    Movement {
        source: DeviceKind,
        target: DeviceKind,
    },
    /// Operation with its exact parameter bag.
    Call { fct: &'a str, params: &'a Params },
    /// Any execution of the function, parameters ignored.
    Fct { fct: &'a str },
}

#[derive(Clone, Debug)]
pub struct DurationEstimator {
    confidence: f64,
    min_samples: usize,
}

impl DurationEstimator {
    pub fn new(config: &EstimatorConfig) -> Self {
        Self {
            confidence: config.confidence,
            min_samples: config.min_samples.max(2),
        }
    }

    /// Estimate at the configured confidence.
    pub fn estimate(&self, history: &[HistoryRecord], key: &EstimateKey<'_>) -> Option<Duration> {
        self.estimate_at(history, key, self.confidence)
    }

    /// Estimate at an explicit confidence.
    pub fn estimate_at(
        &self,
        history: &[HistoryRecord],
        key: &EstimateKey<'_>,
        confidence: f64,
    ) -> Option<Duration> {
        let samples: Vec<f64> = history
            .iter()
            .filter(|r| r.status == StepStatus::Ok && !r.is_simulation)
            .filter(|r| Self::matches(r, key))
            .map(|r| r.elapsed().as_secs_f64())
            .collect();
        if samples.len() < self.min_samples {
            return None;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let bound = mean + z_value(confidence) * var.sqrt();
        Some(Duration::from_secs_f64(bound.max(0.0)))
    }

    fn matches(record: &HistoryRecord, key: &EstimateKey<'_>) -> bool {
        match key {
            EstimateKey::Movement { source, target } => record
                .movement
                .as_ref()
                .is_some_and(|m| m.source_kind == *source && m.target_kind == *target),
            EstimateKey::Call { fct, params } => {
                record.step_name == *fct
                    && canonical_params(&record.params) == canonical_params(params)
            }
            EstimateKey::Fct { fct } => record.step_name == *fct,
        }
    }
}

/// Standard normal quantile for the nearest supported confidence level.
fn z_value(confidence: f64) -> f64 {
    const TABLE: [(f64, f64); 5] = [
        (0.80, 0.8416),
        (0.90, 1.2816),
        (0.95, 1.6449),
        (0.975, 1.9600),
        (0.99, 2.3263),
    ];
    let mut best = TABLE[2];
    for entry in TABLE {
        if (entry.0 - confidence).abs() < (best.0 - confidence).abs() {
            best = entry;
        }
    }
    best.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ContainerId, ParamValue, Position};
    use crate::store::history::MovementRecord;
    use chrono::{TimeDelta, Utc};
    use uuid::Uuid;

    fn record(fct: &str, secs: i64) -> HistoryRecord {
        let finished = Utc::now();
        HistoryRecord {
            experiment: Uuid::new_v4(),
            step_name: fct.into(),
            device: "Inc".into(),
            device_kind: DeviceKind::Incubator,
            containers: vec![ContainerId(0)],
            started: finished - TimeDelta::seconds(secs),
            finished,
            status: StepStatus::Ok,
            value: None,
            params: Params::new(),
            movement: None,
            is_simulation: false,
        }
    }

    fn estimator(min_samples: usize) -> DurationEstimator {
        DurationEstimator::new(&EstimatorConfig {
            confidence: 0.95,
            min_samples,
        })
    }

    #[test]
    fn test_below_minimum_returns_none() {
        let history = vec![record("incubate", 60)];
        assert!(estimator(3)
            .estimate(&history, &EstimateKey::Fct { fct: "incubate" })
            .is_none());
    }

    #[test]
    fn test_bound_exceeds_mean_with_spread() {
        let history = vec![
            record("incubate", 50),
            record("incubate", 60),
            record("incubate", 70),
        ];
        let bound = estimator(3)
            .estimate(&history, &EstimateKey::Fct { fct: "incubate" })
            .expect("enough samples");
        assert!(bound.as_secs_f64() > 60.0);
        assert!(bound.as_secs_f64() < 120.0);
    }

    #[test]
    fn test_constant_samples_give_mean() {
        let history = vec![record("spin", 30), record("spin", 30)];
        let bound = estimator(2)
            .estimate(&history, &EstimateKey::Fct { fct: "spin" })
            .expect("enough samples");
        assert!((bound.as_secs_f64() - 30.0).abs() < 0.5);
    }

    #[test]
    fn test_param_bag_discriminates() {
        let mut hot = record("incubate", 300);
        hot.params.insert("temp".into(), ParamValue::Float(310.0));
        let history = vec![hot.clone(), hot.clone(), hot];
        let mut cold = Params::new();
        cold.insert("temp".into(), ParamValue::Float(277.0));
        assert!(estimator(2)
            .estimate(
                &history,
                &EstimateKey::Call {
                    fct: "incubate",
                    params: &cold
                }
            )
            .is_none());
    }

    #[test]
    fn test_movement_matched_by_kind_pair() {
        let mut rec = record("move", 12);
        rec.movement = Some(MovementRecord {
            origin: Position::new(crate::core::DeviceId(0), 0),
            destination: Position::new(crate::core::DeviceId(1), 0),
            source_kind: DeviceKind::Storage,
            target_kind: DeviceKind::Incubator,
            lidded: true,
            lid_parked_at: None,
        });
        let history = vec![rec.clone(), rec];
        let bound = estimator(2)
            .estimate(
                &history,
                &EstimateKey::Movement {
                    source: DeviceKind::Storage,
                    target: DeviceKind::Incubator,
                },
            )
            .expect("matched");
        assert!((bound.as_secs_f64() - 12.0).abs() < 0.5);
        assert!(estimator(2)
            .estimate(
                &history,
                &EstimateKey::Movement {
                    source: DeviceKind::Incubator,
                    target: DeviceKind::Storage,
                },
            )
            .is_none());
    }

    #[test]
    fn test_simulated_records_excluded() {
        let mut rec = record("read", 5);
        rec.is_simulation = true;
        let history = vec![rec.clone(), rec];
        assert!(estimator(2)
            .estimate(&history, &EstimateKey::Fct { fct: "read" })
            .is_none());
    }
}
