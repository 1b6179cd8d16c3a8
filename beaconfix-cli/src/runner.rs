//! Shared setup for commands that run the service.
//!
//! [`CliRunner`] loads and validates the configuration, installs logging,
//! owns the tokio runtime, and drives a [`BeaconService`] until Ctrl+C.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use beaconfix::config::ConfigFile;
use beaconfix::logging::{init_logging, LogGuard};
use beaconfix::peripheral::PeripheralAdapter;
use beaconfix::quote::ReferenceSource;
use beaconfix::service::{BeaconService, ServiceConfig};
use beaconfix::telemetry::TelemetrySnapshot;
use tokio::runtime::Runtime;
use tracing::info;

use crate::error::CliError;

/// Interval between progress lines while the service runs.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

pub struct CliRunner {
    config: ConfigFile,
    runtime: Runtime,
    _log_guard: LogGuard,
}

impl CliRunner {
    /// Load configuration, set up logging and build the runtime.
    pub fn new(config_path: Option<&Path>, log_level: Option<&str>) -> Result<Self, CliError> {
        let config = load_config(config_path)?;
        config.validate()?;

        let mut log_config = config.log_config();
        if let Some(level) = log_level {
            log_config = log_config.with_level(level);
        }
        let log_guard = init_logging(&log_config)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(CliError::Runtime)?;

        Ok(Self {
            config,
            runtime,
            _log_guard: log_guard,
        })
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn log_startup(&self, command: &str) {
        info!(
            version = beaconfix::VERSION,
            command,
            beacons = self.config.beacons.len(),
            "beaconfix starting"
        );
    }

    /// Start the service and block until Ctrl+C or until the pipeline ends.
    pub fn run_service(
        &self,
        config: ServiceConfig,
        adapter: Arc<dyn PeripheralAdapter>,
        reference: Arc<dyn ReferenceSource>,
    ) -> Result<(), CliError> {
        self.runtime.block_on(async {
            let service = BeaconService::start(config, adapter, reference).await?;

            println!("Listening on ws://{}", service.local_addr());
            println!("Press Ctrl+C to stop");
            println!();

            let cancel = service.cancellation();
            ctrlc::set_handler(move || {
                println!();
                println!("Received shutdown signal, stopping...");
                cancel.cancel();
            })
            .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

            let cancel = service.cancellation();
            let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
            progress.tick().await;
            let mut poll = tokio::time::interval(Duration::from_millis(200));

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = poll.tick() => {
                        if service.is_finished() {
                            println!("Scan ended without a usable beacon set.");
                            break;
                        }
                    }
                    _ = progress.tick() => print_progress(&service.telemetry_snapshot()),
                }
            }

            let snapshot = service.telemetry_snapshot();
            let report = service.shutdown().await?;

            println!();
            println!("Session Summary");
            println!("───────────────");
            println!("  Beacons found: {}", report.beacons_found);
            println!("{}", snapshot);
            Ok(())
        })
    }
}

fn load_config(path: Option<&Path>) -> Result<ConfigFile, CliError> {
    match path {
        Some(path) => Ok(ConfigFile::load_from(path)?),
        None => Ok(ConfigFile::load()?),
    }
}

fn print_progress(snapshot: &TelemetrySnapshot) {
    println!(
        "[{:.0}s] Cycles: {} completed, {} resolved | Sessions: {} ok, {} failed | Subscribers: {}",
        snapshot.uptime.as_secs_f64(),
        snapshot.cycles_completed,
        snapshot.positions_resolved,
        snapshot.sessions_succeeded,
        snapshot.sessions_failed.total(),
        snapshot.active_subscribers()
    );
}
