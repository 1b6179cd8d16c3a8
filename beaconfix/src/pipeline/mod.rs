//! Acquisition-and-fusion pipeline.
//!
//! Wires the components together:
//!
//! ```text
//! PeripheralScanner ──Discovered──► resolve beacon ──► worker (one per beacon)
//!                                                        │ loop until cancelled:
//!                                                        │   PeripheralSession::run
//!                                                        │   ReferenceSource::fetch_quote
//!                                                        │   DistanceEstimator::estimate
//!                                                        │   FusionStore::record
//!                                                        │      └─ Complete ──► solve ──► publish
//!                                                        │   sleep(rearm_interval)
//! ```
//!
//! Every per-beacon failure (session, quote, estimate, fusion rejection) is
//! logged, counted and dropped; the beacon simply does not contribute until
//! its next session. The only error [`BeaconPipeline::run`] returns is
//! [`PipelineError::Configuration`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::beacon::{BeaconId, BeaconSet};
use crate::broadcast::{Payload, PositionBroadcaster, ProximityEntry, TransportError};
use crate::config::ConfigError;
use crate::estimator::{DistanceEstimator, GrowthModel, PathLossModel};
use crate::fusion::{FusionRecord, FusionStore, NegativeDistancePolicy, RecordOutcome};
use crate::peripheral::{PeripheralAdapter, PeripheralHandle};
use crate::quote::{ReferenceQuote, ReferenceSource};
use crate::scanner::{PeripheralScanner, ScanEnd, ScanError, ScanEvent, ScanFilter};
use crate::session::{PeripheralSession, SessionStage, SessionTarget, SessionTimeouts};
use crate::telemetry::PipelineMetrics;
use crate::trilateration::{Position, TrilaterationSolver, ANCHOR_COUNT};

/// Default pause between a beacon's sessions.
pub const DEFAULT_REARM_INTERVAL: Duration = Duration::from_secs(2);

/// Default deadline for one reference quote fetch.
pub const DEFAULT_QUOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Typed configuration injected into the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub beacons: BeaconSet,
    pub target: SessionTarget,
    /// Overall scan deadline; `None` scans until shutdown.
    pub scan_deadline: Option<Duration>,
    pub timeouts: SessionTimeouts,
    pub rearm_interval: Duration,
    pub model: GrowthModel,
    pub negative_distance: NegativeDistancePolicy,
    pub degenerate_epsilon: f64,
    /// Symbol requested from the reference source.
    pub symbol: String,
    pub quote_timeout: Duration,
    pub path_loss: PathLossModel,
}

impl PipelineConfig {
    /// Configuration with defaults for everything but the beacons and target.
    pub fn new(beacons: BeaconSet, target: SessionTarget) -> Self {
        Self {
            beacons,
            target,
            scan_deadline: None,
            timeouts: SessionTimeouts::default(),
            rearm_interval: DEFAULT_REARM_INTERVAL,
            model: GrowthModel::default(),
            negative_distance: NegativeDistancePolicy::default(),
            degenerate_epsilon: crate::trilateration::DEFAULT_DEGENERATE_EPSILON,
            symbol: "BTC".to_string(),
            quote_timeout: DEFAULT_QUOTE_TIMEOUT,
            path_loss: PathLossModel::default(),
        }
    }

    pub fn with_model(mut self, model: GrowthModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_rearm_interval(mut self, interval: Duration) -> Self {
        self.rearm_interval = interval;
        self
    }

    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_negative_distance(mut self, policy: NegativeDistancePolicy) -> Self {
        self.negative_distance = policy;
        self
    }

    pub fn with_scan_deadline(mut self, deadline: Duration) -> Self {
        self.scan_deadline = Some(deadline);
        self
    }
}

/// Errors that stop the whole pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Adapter or listener unavailable, or invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<ScanError> for PipelineError {
    fn from(err: ScanError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<TransportError> for PipelineError {
    fn from(err: TransportError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    /// Distinct configured beacons discovered.
    pub beacons_found: usize,
    /// Why the scan ended.
    pub scan_end: Option<ScanEnd>,
}

/// State shared by the pipeline and its per-beacon workers.
struct Shared {
    config: PipelineConfig,
    reference: Arc<dyn ReferenceSource>,
    estimator: DistanceEstimator,
    fusion: FusionStore,
    solver: TrilaterationSolver,
    broadcaster: Arc<PositionBroadcaster>,
    metrics: Arc<PipelineMetrics>,
    stages: DashMap<BeaconId, SessionStage>,
}

/// The acquisition-and-fusion pipeline.
pub struct BeaconPipeline {
    scanner: PeripheralScanner,
    shared: Arc<Shared>,
}

impl BeaconPipeline {
    /// Build a pipeline.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Configuration`] unless exactly three beacons are
    /// configured.
    pub fn new(
        config: PipelineConfig,
        adapter: Arc<dyn PeripheralAdapter>,
        reference: Arc<dyn ReferenceSource>,
        broadcaster: Arc<PositionBroadcaster>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, PipelineError> {
        if config.beacons.len() != ANCHOR_COUNT {
            return Err(PipelineError::Configuration(format!(
                "exactly {} beacons required, {} configured",
                ANCHOR_COUNT,
                config.beacons.len()
            )));
        }

        let fusion = FusionStore::new(config.beacons.ids().cloned(), config.negative_distance);
        let shared = Shared {
            estimator: DistanceEstimator::new(config.model),
            solver: TrilaterationSolver::new(config.degenerate_epsilon),
            fusion,
            config,
            reference,
            broadcaster,
            metrics,
            stages: DashMap::new(),
        };

        Ok(Self {
            scanner: PeripheralScanner::new(adapter),
            shared: Arc::new(shared),
        })
    }

    /// Shared counters.
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.shared.metrics
    }

    /// Latest session stage of every beacon with a running worker.
    pub fn status(&self) -> Vec<(BeaconId, SessionStage)> {
        let mut status: Vec<_> = self
            .shared
            .stages
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        status.sort_by(|a, b| a.0.cmp(&b.0));
        status
    }

    /// Beacons missing from the active fusion cycle.
    pub fn pending(&self) -> Vec<BeaconId> {
        self.shared.fusion.pending()
    }

    /// Run until `cancel` fires.
    ///
    /// Returns early, without error, if the scan ends having found no
    /// configured beacon.
    pub async fn run(&self, cancel: CancellationToken) -> Result<PipelineReport, PipelineError> {
        let config = &self.shared.config;
        let mut filter = ScanFilter::new(config.target.service.clone());
        filter.deadline = config.scan_deadline;

        let mut events = self.scanner.scan(filter, cancel.clone()).await?;
        info!(beacons = config.beacons.len(), "Pipeline started");

        let mut workers = JoinSet::new();
        let mut active: HashSet<BeaconId> = HashSet::new();
        let mut scan_end = None;

        while let Some(event) = events.recv().await {
            match event {
                ScanEvent::Discovered(peripheral) => {
                    if let Some(id) = self.shared.admit(&peripheral) {
                        if active.insert(id.clone()) {
                            let shared = Arc::clone(&self.shared);
                            workers.spawn(beacon_worker(shared, id, peripheral, cancel.clone()));
                        }
                    }
                }
                ScanEvent::Finished { reason, .. } => {
                    scan_end = Some(reason);
                    break;
                }
            }
        }

        if active.is_empty() {
            warn!(scan_end = ?scan_end, "No configured beacon found, pipeline idle");
        } else if active.len() < config.beacons.len() {
            let missing: Vec<_> = config
                .beacons
                .ids()
                .filter(|id| !active.contains(*id))
                .map(|id| id.to_string())
                .collect();
            warn!(missing = ?missing, "Not every beacon was found; cycles cannot complete");
        }

        while workers.join_next().await.is_some() {}

        info!(
            beacons_found = active.len(),
            cycles = self.shared.metrics.snapshot().cycles_completed,
            "Pipeline stopped"
        );
        Ok(PipelineReport {
            beacons_found: active.len(),
            scan_end,
        })
    }
}

impl Shared {
    /// Match a discovered peripheral to a configured beacon and publish its
    /// proximity.
    fn admit(&self, peripheral: &PeripheralHandle) -> Option<BeaconId> {
        let adv = peripheral.advertisement();
        let Some(beacon) = self
            .config
            .beacons
            .resolve(adv.local_name.as_deref(), &adv.address)
        else {
            debug!(peripheral = adv.label(), "Ignoring unconfigured peripheral");
            self.metrics.peripheral_unmatched();
            return None;
        };

        self.metrics.peripheral_discovered();
        let proximity = self.config.path_loss.classify(adv.rssi);
        self.broadcaster.update_proximity(ProximityEntry {
            id: beacon.id.clone(),
            proximity,
            rssi: adv.rssi,
        });
        info!(beacon = %beacon.id, address = %adv.address, ?proximity, "Beacon discovered");
        Some(beacon.id.clone())
    }

    /// One session plus estimate for one beacon.
    async fn contribute(
        self: &Arc<Self>,
        id: &BeaconId,
        peripheral: PeripheralHandle,
        cancel: &CancellationToken,
    ) {
        self.metrics.session_started();
        let observer = Arc::clone(self);
        let session = PeripheralSession::new(
            id.clone(),
            peripheral,
            self.config.target.clone(),
            self.config.timeouts,
        )
        .with_observer(Box::new(move |beacon, stage| {
            observer.stages.insert(beacon.clone(), stage);
        }));

        let reading = match session.run(cancel.clone()).await.result {
            Ok(reading) => {
                self.metrics.session_succeeded();
                reading
            }
            Err(failure) => {
                self.metrics.session_failed(&failure);
                return;
            }
        };

        let symbol = self.config.symbol.as_str();
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return,
            r = tokio::time::timeout(self.config.quote_timeout, self.reference.fetch_quote(symbol)) => r,
        };
        let current = match fetched {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!(beacon = %id, source = self.reference.name(), error = %e, "Reference quote failed");
                self.metrics.quote_failed();
                return;
            }
            Err(_) => {
                warn!(beacon = %id, source = self.reference.name(), "Reference quote timed out");
                self.metrics.quote_failed();
                return;
            }
        };

        let quote = ReferenceQuote::new(symbol, current, reading.read_at);
        let estimate = match self.estimator.estimate(&reading, &quote) {
            Ok(estimate) => estimate,
            Err(e) => {
                warn!(beacon = %id, value = reading.value, error = %e, "Distance estimate failed");
                self.metrics.quote_failed();
                return;
            }
        };

        let distance = estimate.distance;
        match self.fusion.record(id, estimate) {
            Ok(RecordOutcome::Pending { have, need }) => {
                self.metrics.estimate_recorded();
                debug!(beacon = %id, distance, have, need, "Cycle pending");
            }
            Ok(RecordOutcome::Complete(record)) => {
                self.metrics.estimate_recorded();
                self.metrics.cycle_completed();
                self.resolve(record);
            }
            Err(e) => {
                self.metrics.estimate_rejected();
                warn!(beacon = %id, error = %e, "Estimate rejected");
            }
        }
    }

    /// Solve a completed cycle and publish the outcome.
    fn resolve(&self, record: FusionRecord) {
        match self.solver.solve_record(&self.config.beacons, &record) {
            Position::Resolved(point) => {
                self.metrics.position_resolved();
                info!(cycle = record.cycle, position = %point, "Position resolved");
                self.broadcaster.publish(Payload::position(&record, point));
            }
            Position::Unresolved(e) => {
                self.metrics.degenerate_solve();
                warn!(cycle = record.cycle, error = %e, "Cycle discarded");
                self.broadcaster.publish(Payload::unresolved(record.cycle, &e));
            }
        }
    }
}

/// Re-arm sessions for one beacon until cancelled.
async fn beacon_worker(
    shared: Arc<Shared>,
    id: BeaconId,
    peripheral: PeripheralHandle,
    cancel: CancellationToken,
) {
    debug!(beacon = %id, "Worker started");
    while !cancel.is_cancelled() {
        shared.contribute(&id, peripheral.clone(), &cancel).await;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.config.rearm_interval) => {}
        }
    }
    shared.stages.remove(&id);
    debug!(beacon = %id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::Beacon;
    use crate::broadcast::BroadcastConfig;
    use crate::coord::Point2;
    use crate::peripheral::{SimulatedAdapter, SimulatedBeacon};
    use crate::quote::StaticReferenceSource;

    const SERVICE: &str = "12345678-1234-5678-1234-56789abcdef0";
    const CHAR: &str = "abcdef12-3456-7890-abcd-ef1234567890";

    fn target() -> SessionTarget {
        SessionTarget {
            service: SERVICE.into(),
            characteristic: CHAR.into(),
        }
    }

    fn beacons(n: usize) -> BeaconSet {
        let all = [("alpha", 0.0, 0.0), ("bravo", 5.0, 0.0), ("charlie", 2.0, 4.0), ("delta", 9.0, 9.0)];
        BeaconSet::new(
            all.iter()
                .take(n)
                .map(|(id, x, y)| Beacon::new(*id, Point2::new(*x, *y))),
        )
        .unwrap()
    }

    fn pipeline(adapter: SimulatedAdapter, n: usize) -> Result<BeaconPipeline, PipelineError> {
        BeaconPipeline::new(
            PipelineConfig::new(beacons(n), target()),
            Arc::new(adapter),
            Arc::new(StaticReferenceSource::new(1.0e9)),
            Arc::new(PositionBroadcaster::new(BroadcastConfig::default())),
            Arc::new(PipelineMetrics::new()),
        )
    }

    #[test]
    fn test_wrong_beacon_count_is_configuration_error() {
        assert!(matches!(
            pipeline(SimulatedAdapter::new(Vec::new()), 2),
            Err(PipelineError::Configuration(_))
        ));
        assert!(pipeline(SimulatedAdapter::new(Vec::new()), 4).is_err());
    }

    #[tokio::test]
    async fn test_unavailable_adapter_is_fatal() {
        let pipeline = pipeline(SimulatedAdapter::unavailable(), 3).unwrap();
        let result = pipeline.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_beacons_found_returns() {
        let stranger = SimulatedBeacon::new("FF:00", "stranger", SERVICE.into(), CHAR.into());
        let adapter = SimulatedAdapter::new(vec![stranger]);
        let mut config = PipelineConfig::new(beacons(3), target());
        config.scan_deadline = Some(Duration::from_secs(1));

        let metrics = Arc::new(PipelineMetrics::new());
        let pipeline = BeaconPipeline::new(
            config,
            Arc::new(adapter),
            Arc::new(StaticReferenceSource::new(1.0)),
            Arc::new(PositionBroadcaster::new(BroadcastConfig::default())),
            Arc::clone(&metrics),
        )
        .unwrap();

        let report = pipeline.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.beacons_found, 0);
        assert_eq!(report.scan_end, Some(ScanEnd::DeadlineElapsed));
        assert_eq!(metrics.snapshot().peripherals_unmatched, 1);
    }
}
