//! Simulated device adapter.
//!
//! Sleeps for the scheduled duration (optionally accelerated), emits a few
//! progress observations, and returns a synthesized value. Parameters let a
//! workflow steer the simulation:
//!
//! - `sim_value`: the value the operation returns on success;
//! - `sim_fail`: force a failure instead of success;
//! - `sim_ignore_cancel`: refuse cooperative cancellation;
//! - `sim_extra_secs`: run this much longer than scheduled (exercises the
//!   executor's deviation handling).

use crate::adapters::{DeviceAdapter, Observation, OperationHandle, StepDispatch};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

pub struct SimulatedAdapter {
    speed: f64,
}

impl SimulatedAdapter {
    pub fn new(speed: f64) -> Self {
        Self {
            speed: if speed > 0.0 { speed } else { 1.0 },
        }
    }
}

pub struct SimulatedHandle {
    rx: Option<mpsc::Receiver<Observation>>,
    cancel: Arc<Notify>,
    honours_cancel: bool,
}

#[async_trait]
impl OperationHandle for SimulatedHandle {
    fn observations(&mut self) -> Option<mpsc::Receiver<Observation>> {
        self.rx.take()
    }

    async fn cancel(&mut self) -> bool {
        if self.honours_cancel {
            self.cancel.notify_one();
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl DeviceAdapter for SimulatedAdapter {
    async fn submit(&self, dispatch: StepDispatch) -> anyhow::Result<Box<dyn OperationHandle>> {
        let (tx, rx) = mpsc::channel(8);
        let cancel = Arc::new(Notify::new());
        let honours_cancel = !dispatch
            .params
            .get("sim_ignore_cancel")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let cancel_task = Arc::clone(&cancel);
        let speed = self.speed;
        tokio::spawn(async move {
            let extra = dispatch
                .params
                .get("sim_extra_secs")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let total = dispatch.scheduled_duration.as_secs_f64() + extra;
            let scaled = Duration::from_secs_f64((total / speed).max(0.0));
            debug!(
                step = %dispatch.step,
                fct = %dispatch.fct,
                device = %dispatch.device,
                secs = scaled.as_secs_f64(),
                "simulated operation started"
            );
            let _ = tx.send(Observation::started()).await;

            // Four progress ticks, any of which a cancel may interrupt.
            let slice = scaled / 4;
            for tick in 1..=4u32 {
                tokio::select! {
                    _ = tokio::time::sleep(slice) => {
                        let _ = tx.send(Observation::running(tick as f64 / 4.0)).await;
                    }
                    _ = cancel_task.notified(), if honours_cancel => {
                        debug!(step = %dispatch.step, "simulated operation cancelled");
                        let _ = tx.send(Observation::cancelled()).await;
                        return;
                    }
                }
            }

            if dispatch
                .params
                .get("sim_fail")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                let _ = tx.send(Observation::failed("simulated failure")).await;
                return;
            }
            let value = dispatch.params.get("sim_value").cloned();
            let _ = tx.send(Observation::ok(value)).await;
        });

        Ok(Box::new(SimulatedHandle {
            rx: Some(rx),
            cancel,
            honours_cancel,
        }))
    }
}
