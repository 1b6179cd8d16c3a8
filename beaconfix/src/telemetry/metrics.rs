//! Atomic pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::session::SessionFailure;

use super::snapshot::{SessionFailureCounts, TelemetrySnapshot};

/// Lock-free counters shared by every pipeline stage.
#[derive(Debug)]
pub struct PipelineMetrics {
    started_at: Instant,

    // Discovery and sessions
    peripherals_discovered: AtomicU64,
    peripherals_unmatched: AtomicU64,
    sessions_started: AtomicU64,
    sessions_succeeded: AtomicU64,
    failed_connection_refused: AtomicU64,
    failed_service_not_found: AtomicU64,
    failed_characteristic_not_found: AtomicU64,
    failed_read_timeout: AtomicU64,
    failed_read_error: AtomicU64,
    failed_aborted: AtomicU64,

    // Estimation and fusion
    quote_failures: AtomicU64,
    estimates_recorded: AtomicU64,
    estimates_rejected: AtomicU64,
    cycles_completed: AtomicU64,
    positions_resolved: AtomicU64,
    degenerate_solves: AtomicU64,

    // Broadcast
    payloads_published: AtomicU64,
    payloads_dropped: AtomicU64,
    subscribers_connected: AtomicU64,
    subscribers_dropped: AtomicU64,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    /// Create a zeroed set of counters.
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            peripherals_discovered: AtomicU64::new(0),
            peripherals_unmatched: AtomicU64::new(0),
            sessions_started: AtomicU64::new(0),
            sessions_succeeded: AtomicU64::new(0),
            failed_connection_refused: AtomicU64::new(0),
            failed_service_not_found: AtomicU64::new(0),
            failed_characteristic_not_found: AtomicU64::new(0),
            failed_read_timeout: AtomicU64::new(0),
            failed_read_error: AtomicU64::new(0),
            failed_aborted: AtomicU64::new(0),
            quote_failures: AtomicU64::new(0),
            estimates_recorded: AtomicU64::new(0),
            estimates_rejected: AtomicU64::new(0),
            cycles_completed: AtomicU64::new(0),
            positions_resolved: AtomicU64::new(0),
            degenerate_solves: AtomicU64::new(0),
            payloads_published: AtomicU64::new(0),
            payloads_dropped: AtomicU64::new(0),
            subscribers_connected: AtomicU64::new(0),
            subscribers_dropped: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    // =========================================================================
    // Discovery and sessions
    // =========================================================================

    /// A configured beacon was discovered.
    pub fn peripheral_discovered(&self) {
        Self::bump(&self.peripherals_discovered);
    }

    /// A peripheral advertised the service but matched no configured beacon.
    pub fn peripheral_unmatched(&self) {
        Self::bump(&self.peripherals_unmatched);
    }

    pub fn session_started(&self) {
        Self::bump(&self.sessions_started);
    }

    pub fn session_succeeded(&self) {
        Self::bump(&self.sessions_succeeded);
    }

    /// A session ended in `Failed`, counted per reason.
    pub fn session_failed(&self, failure: &SessionFailure) {
        let counter = match failure {
            SessionFailure::ConnectionRefused(_) => &self.failed_connection_refused,
            SessionFailure::ServiceNotFound(_) => &self.failed_service_not_found,
            SessionFailure::CharacteristicNotFound(_) => &self.failed_characteristic_not_found,
            SessionFailure::ReadTimeout(_) => &self.failed_read_timeout,
            SessionFailure::ReadError(_) => &self.failed_read_error,
            SessionFailure::Aborted(_) => &self.failed_aborted,
        };
        Self::bump(counter);
    }

    // =========================================================================
    // Estimation and fusion
    // =========================================================================

    pub fn quote_failed(&self) {
        Self::bump(&self.quote_failures);
    }

    pub fn estimate_recorded(&self) {
        Self::bump(&self.estimates_recorded);
    }

    /// An estimate was refused by the fusion store or the distance policy.
    pub fn estimate_rejected(&self) {
        Self::bump(&self.estimates_rejected);
    }

    pub fn cycle_completed(&self) {
        Self::bump(&self.cycles_completed);
    }

    pub fn position_resolved(&self) {
        Self::bump(&self.positions_resolved);
    }

    pub fn degenerate_solve(&self) {
        Self::bump(&self.degenerate_solves);
    }

    // =========================================================================
    // Broadcast
    // =========================================================================

    pub fn payload_published(&self) {
        Self::bump(&self.payloads_published);
    }

    /// A subscriber's queue was full and its copy of a payload was lost.
    pub fn payload_dropped(&self) {
        Self::bump(&self.payloads_dropped);
    }

    pub fn subscriber_connected(&self) {
        Self::bump(&self.subscribers_connected);
    }

    pub fn subscriber_dropped(&self) {
        Self::bump(&self.subscribers_dropped);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TelemetrySnapshot {
            uptime: self.started_at.elapsed(),
            peripherals_discovered: load(&self.peripherals_discovered),
            peripherals_unmatched: load(&self.peripherals_unmatched),
            sessions_started: load(&self.sessions_started),
            sessions_succeeded: load(&self.sessions_succeeded),
            sessions_failed: SessionFailureCounts {
                connection_refused: load(&self.failed_connection_refused),
                service_not_found: load(&self.failed_service_not_found),
                characteristic_not_found: load(&self.failed_characteristic_not_found),
                read_timeout: load(&self.failed_read_timeout),
                read_error: load(&self.failed_read_error),
                aborted: load(&self.failed_aborted),
            },
            quote_failures: load(&self.quote_failures),
            estimates_recorded: load(&self.estimates_recorded),
            estimates_rejected: load(&self.estimates_rejected),
            cycles_completed: load(&self.cycles_completed),
            positions_resolved: load(&self.positions_resolved),
            degenerate_solves: load(&self.degenerate_solves),
            payloads_published: load(&self.payloads_published),
            payloads_dropped: load(&self.payloads_dropped),
            subscribers_connected: load(&self.subscribers_connected),
            subscribers_dropped: load(&self.subscribers_dropped),
        }
    }
}
