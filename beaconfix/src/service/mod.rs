//! Service orchestration.
//!
//! [`BeaconService`] starts and stops everything a running beaconfix needs:
//!
//! 1. telemetry counters
//! 2. the position broadcaster and its WebSocket listener
//! 3. the acquisition-and-fusion pipeline
//!
//! Startup fails fast with [`PipelineError::Configuration`] when the
//! listener cannot bind or the pipeline configuration is unusable. Shutdown
//! cancels one token shared by every task and waits for them to finish.
//!
//! # Example
//!
//! ```ignore
//! use beaconfix::service::{BeaconService, ServiceConfig};
//!
//! let service = BeaconService::start(config, adapter, reference).await?;
//! println!("listening on {}", service.local_addr());
//!
//! // ... later
//! let report = service.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::beacon::BeaconId;
use crate::broadcast::{BroadcastConfig, BroadcastServer, PositionBroadcaster};
use crate::peripheral::PeripheralAdapter;
use crate::pipeline::{BeaconPipeline, PipelineConfig, PipelineError, PipelineReport};
use crate::quote::ReferenceSource;
use crate::session::SessionStage;
use crate::telemetry::{PipelineMetrics, TelemetrySnapshot};

/// Everything needed to start a [`BeaconService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub pipeline: PipelineConfig,
    pub broadcast: BroadcastConfig,
    /// WebSocket listen address.
    pub listen: String,
}

/// A running beaconfix service.
pub struct BeaconService {
    cancellation: CancellationToken,
    metrics: Arc<PipelineMetrics>,
    broadcaster: Arc<PositionBroadcaster>,
    pipeline: Arc<BeaconPipeline>,
    local_addr: SocketAddr,
    pipeline_task: JoinHandle<Result<PipelineReport, PipelineError>>,
    server_task: JoinHandle<()>,
}

impl BeaconService {
    /// Bind the listener and start the pipeline.
    pub async fn start(
        config: ServiceConfig,
        adapter: Arc<dyn PeripheralAdapter>,
        reference: Arc<dyn ReferenceSource>,
    ) -> Result<Self, PipelineError> {
        let cancellation = CancellationToken::new();
        let metrics = Arc::new(PipelineMetrics::new());
        let broadcaster = Arc::new(
            PositionBroadcaster::new(config.broadcast).with_metrics(Arc::clone(&metrics)),
        );

        let server = BroadcastServer::bind(&config.listen, Arc::clone(&broadcaster)).await?;
        let local_addr = server
            .local_addr()
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;

        let pipeline = Arc::new(BeaconPipeline::new(
            config.pipeline,
            adapter,
            reference,
            Arc::clone(&broadcaster),
            Arc::clone(&metrics),
        )?);

        let server_task = tokio::spawn(server.serve(cancellation.child_token()));

        let pipeline_task = {
            let pipeline = Arc::clone(&pipeline);
            let cancel = cancellation.clone();
            tokio::spawn(async move { pipeline.run(cancel).await })
        };

        info!(%local_addr, "beaconfix service started");
        Ok(Self {
            cancellation,
            metrics,
            broadcaster,
            pipeline,
            local_addr,
            pipeline_task,
            server_task,
        })
    }

    /// Address the WebSocket listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The broadcaster feeding subscribers.
    pub fn broadcaster(&self) -> &Arc<PositionBroadcaster> {
        &self.broadcaster
    }

    /// Token cancelling every service task.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        self.metrics.snapshot()
    }

    /// Latest session stage per beacon.
    pub fn beacon_status(&self) -> Vec<(BeaconId, SessionStage)> {
        self.pipeline.status()
    }

    /// Whether the pipeline task has ended on its own.
    pub fn is_finished(&self) -> bool {
        self.pipeline_task.is_finished()
    }

    /// Cancel every task and wait for them.
    pub async fn shutdown(self) -> Result<PipelineReport, PipelineError> {
        info!("Shutting down beaconfix service");
        self.cancellation.cancel();

        let report = match self.pipeline_task.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::Configuration(format!(
                "pipeline task failed: {}",
                e
            ))),
        };
        if let Err(e) = self.server_task.await {
            warn!(error = %e, "Broadcast server task failed");
        }

        info!("beaconfix service stopped");
        report
    }
}
