//! Point-in-time telemetry copy.

use std::fmt;
use std::time::Duration;

/// Session failures broken down by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFailureCounts {
    pub connection_refused: u64,
    pub service_not_found: u64,
    pub characteristic_not_found: u64,
    pub read_timeout: u64,
    pub read_error: u64,
    pub aborted: u64,
}

impl SessionFailureCounts {
    /// Sum over all reasons.
    pub fn total(&self) -> u64 {
        self.connection_refused
            + self.service_not_found
            + self.characteristic_not_found
            + self.read_timeout
            + self.read_error
            + self.aborted
    }
}

/// Snapshot of [`PipelineMetrics`](super::PipelineMetrics).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub uptime: Duration,
    pub peripherals_discovered: u64,
    pub peripherals_unmatched: u64,
    pub sessions_started: u64,
    pub sessions_succeeded: u64,
    pub sessions_failed: SessionFailureCounts,
    pub quote_failures: u64,
    pub estimates_recorded: u64,
    pub estimates_rejected: u64,
    pub cycles_completed: u64,
    pub positions_resolved: u64,
    pub degenerate_solves: u64,
    pub payloads_published: u64,
    pub payloads_dropped: u64,
    pub subscribers_connected: u64,
    pub subscribers_dropped: u64,
}

impl TelemetrySnapshot {
    /// Fraction of completed cycles that produced a position.
    pub fn resolve_rate(&self) -> f64 {
        if self.cycles_completed == 0 {
            0.0
        } else {
            self.positions_resolved as f64 / self.cycles_completed as f64
        }
    }

    /// Subscribers currently believed connected.
    pub fn active_subscribers(&self) -> u64 {
        self.subscribers_connected
            .saturating_sub(self.subscribers_dropped)
    }
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Uptime:              {:.1}s", self.uptime.as_secs_f64())?;
        writeln!(
            f,
            "Peripherals:         {} matched, {} unmatched",
            self.peripherals_discovered, self.peripherals_unmatched
        )?;
        writeln!(
            f,
            "Sessions:            {} started, {} succeeded, {} failed",
            self.sessions_started,
            self.sessions_succeeded,
            self.sessions_failed.total()
        )?;
        let failed = &self.sessions_failed;
        writeln!(
            f,
            "  refused={} service={} characteristic={} timeout={} read={} aborted={}",
            failed.connection_refused,
            failed.service_not_found,
            failed.characteristic_not_found,
            failed.read_timeout,
            failed.read_error,
            failed.aborted
        )?;
        writeln!(
            f,
            "Estimates:           {} recorded, {} rejected, {} quote failures",
            self.estimates_recorded, self.estimates_rejected, self.quote_failures
        )?;
        writeln!(
            f,
            "Cycles:              {} completed, {} resolved, {} degenerate",
            self.cycles_completed, self.positions_resolved, self.degenerate_solves
        )?;
        write!(
            f,
            "Broadcast:           {} payloads, {} dropped, {} subscribers ({} active)",
            self.payloads_published,
            self.payloads_dropped,
            self.subscribers_connected,
            self.active_subscribers()
        )
    }
}
