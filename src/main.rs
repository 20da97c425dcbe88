//! labflow server binary.
//!
//! Loads the lab configuration document, starts the orchestrator with
//! simulated adapters, and serves until interrupted.
//!
//! Exit codes: 0 success, 1 configuration error, 2 runtime fatal, 130
//! interrupted.

use labflow::adapters::AdapterRegistry;
use labflow::app::Orchestrator;
use labflow::config::LabConfig;
use labflow::graph::builder::GraphSpecParser;
use labflow::store::persistence::{Journal, JsonlBackend, StorageBackend};
use labflow::store::StatusStore;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("labflow.yaml"));

    let config = match LabConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.application.log_level.clone())),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::from(2);
        }
    };

    runtime.block_on(async {
        let mut store = StatusStore::new(&config.catalogue());
        if let Some(data_dir) = &config.application.data_dir {
            match JsonlBackend::new(data_dir.clone()) {
                Ok(backend) => {
                    // Learned durations survive restarts.
                    match backend.load_steps().await {
                        Ok(history) => {
                            info!(records = history.len(), "step history loaded");
                            store.preload_history(history);
                        }
                        Err(e) => error!(error = %e, "could not load step history"),
                    }
                    let (journal, _writer) = Journal::spawn(Box::new(backend));
                    store = store.with_journal(journal);
                }
                Err(e) => {
                    error!(error = %e, "could not open data directory; journaling disabled");
                }
            }
        }

        info!(
            lab = %config.description,
            devices = store.devices().len(),
            "labflow starting"
        );
        let registry = AdapterRegistry::simulated(config.simulation.speed.max(1.0));
        let (handle, core) =
            Orchestrator::spawn(config, store, registry, Arc::new(GraphSpecParser));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                let _ = handle.shutdown().await;
                ExitCode::from(130)
            }
            result = core => match result {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    error!(error = %e, "core loop failed");
                    ExitCode::from(2)
                }
                Err(e) => {
                    error!(error = %e, "core loop panicked");
                    ExitCode::from(2)
                }
            }
        }
    })
}
