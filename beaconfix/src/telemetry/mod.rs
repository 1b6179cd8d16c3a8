//! Pipeline telemetry for observability.
//!
//! Cycles that never complete are silent on the broadcast side; these
//! counters are how an operator notices them. All counters are lock-free
//! atomics so recording from concurrent sessions costs next to nothing.
//!
//! # Architecture
//!
//! ```text
//! Sessions / Fusion / Broadcaster ─────► PipelineMetrics ─────► TelemetrySnapshot ─────► CLI
//!                                        (atomic counters)     (point-in-time copy)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use beaconfix::telemetry::PipelineMetrics;
//! use std::sync::Arc;
//!
//! let metrics = Arc::new(PipelineMetrics::new());
//! metrics.session_started();
//! metrics.session_succeeded();
//!
//! let snapshot = metrics.snapshot();
//! println!("Cycles completed: {}", snapshot.cycles_completed);
//! ```

mod metrics;
mod snapshot;

pub use metrics::PipelineMetrics;
pub use snapshot::{SessionFailureCounts, TelemetrySnapshot};
