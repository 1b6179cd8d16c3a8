//! beaconfix - Beacon trilateration with live position broadcasting
//!
//! This library discovers fixed short-range wireless beacons, reads one value
//! from each over its wireless link, turns every reading into a distance
//! estimate, resolves three distances into a room-relative 2D position and
//! pushes the result to any number of live subscribers.
//!
//! # Architecture
//!
//! ```text
//! PeripheralScanner ──► PeripheralSession (one per beacon, concurrent)
//!                                │ RawReading
//!                                ▼
//!                       DistanceEstimator ◄── ReferenceSource (quote)
//!                                │ DistanceEstimate
//!                                ▼
//!                           FusionStore ──(complete cycle)──► TrilaterationSolver
//!                                                                  │ Position
//!                                                                  ▼
//!                                                       PositionBroadcaster ──► subscribers
//! ```

pub mod beacon;
pub mod broadcast;
pub mod config;
pub mod coord;
pub mod estimator;
pub mod fusion;
pub mod logging;
pub mod peripheral;
pub mod pipeline;
pub mod quote;
pub mod scanner;
pub mod service;
pub mod session;
pub mod telemetry;
pub mod trilateration;

/// Library version, as published in the `hello` payload.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name announced to subscribers.
pub const SERVICE_NAME: &str = "beaconfix";
