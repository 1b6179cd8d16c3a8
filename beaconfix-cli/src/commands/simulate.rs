//! Simulate command - run the full pipeline against in-process beacons.
//!
//! Each configured beacon is replaced by a simulated peripheral whose
//! reading is programmed so the estimator recovers the distance from the
//! beacon to a chosen receiver position. The reference quote is fixed.

use std::sync::Arc;

use beaconfix::config::ConfigFile;
use beaconfix::coord::Point2;
use beaconfix::estimator::GrowthModel;
use beaconfix::peripheral::{
    GattUuid, Peripheral, SimulatedAdapter, SimulatedBeacon, SimulatedFault,
};
use beaconfix::quote::StaticReferenceSource;

use super::common::{parse_numbers, service_config, GlobalArgs};
use crate::error::CliError;
use crate::runner::CliRunner;

/// Default fixed reference quote.
pub const DEFAULT_QUOTE: f64 = 1.0e9;

/// Default propagation speed for simulation.
///
/// Room-scale distances at the speed of light change a 32-bit reading by
/// less than one unit, so simulations scale the speed down.
pub const DEFAULT_PROPAGATION_SPEED: f64 = 1.0e-3;

/// Arguments for the simulate command.
pub struct SimulateArgs {
    pub global: GlobalArgs,
    pub listen: Option<String>,
    /// Receiver position as `x,y`.
    pub position: String,
    pub quote: f64,
    pub propagation_speed: f64,
    /// Beacons that refuse their first connection.
    pub flaky: Vec<String>,
}

/// Run the simulate command.
pub fn run(args: SimulateArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(args.global.config.as_deref(), args.global.log_level.as_deref())?;
    runner.log_startup("simulate");
    let config = runner.config();

    let [x, y] = parse_numbers::<2>(&args.position)?;
    let receiver = Point2::new(x, y);
    let model = config
        .growth_model()
        .with_propagation_speed(args.propagation_speed);
    let pipeline = config.pipeline_config()?.with_model(model);

    let beacons = simulated_beacons(config, &model, receiver, args.quote)?;
    for name in &args.flaky {
        let beacon = beacons
            .iter()
            .find(|b| b.advertisement().label().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| CliError::Config(format!("No beacon named '{}'", name)))?;
        beacon.fail_next(SimulatedFault::RefuseConnection);
    }

    println!("beaconfix v{} (simulation)", beaconfix::VERSION);
    println!("================================");
    println!();
    println!("Receiver:   {}", receiver);
    println!("Quote:      {}", args.quote);
    for beacon in &config.beacons {
        let anchor = Point2::new(beacon.x, beacon.y);
        println!(
            "Beacon {:<12} at {}  distance {:.3}",
            beacon.name,
            anchor,
            anchor.distance_to(&receiver)
        );
    }
    println!();

    let adapter = Arc::new(SimulatedAdapter::from_shared(beacons));
    let reference = Arc::new(StaticReferenceSource::new(args.quote));
    runner.run_service(service_config(config, pipeline, args.listen), adapter, reference)
}

/// One simulated peripheral per configured beacon.
fn simulated_beacons(
    config: &ConfigFile,
    model: &GrowthModel,
    receiver: Point2,
    quote: f64,
) -> Result<Vec<Arc<SimulatedBeacon>>, CliError> {
    let service = GattUuid::new(&config.scan.service_uuid);
    let characteristic = GattUuid::new(&config.scan.characteristic_uuid);

    config
        .beacons
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let anchor = Point2::new(entry.x, entry.y);
            let value = reading_for(model, quote, anchor.distance_to(&receiver))
                .ok_or_else(|| {
                    CliError::Config(format!(
                        "Beacon '{}' reading does not fit 32 bits; lower --quote",
                        entry.name
                    ))
                })?;
            let beacon = SimulatedBeacon::new(
                &format!("5E:00:00:00:00:{:02X}", i),
                &entry.name,
                service.clone(),
                characteristic.clone(),
            )
            .with_value(value)
            .with_rssi(-55 - 5 * i as i16);
            Ok(Arc::new(beacon))
        })
        .collect()
}

/// The 32-bit reading a beacon at `distance` reports against `quote`.
fn reading_for(model: &GrowthModel, quote: f64, distance: f64) -> Option<i32> {
    let value = model.historical_for_distance(quote, distance).round();
    if value.is_finite() && value >= 1.0 && value <= f64::from(i32::MAX) {
        Some(value as i32)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> GrowthModel {
        GrowthModel::default().with_propagation_speed(DEFAULT_PROPAGATION_SPEED)
    }

    #[test]
    fn test_reading_round_trips_distance() {
        let model = model();
        let value = reading_for(&model, DEFAULT_QUOTE, 3.0).unwrap();
        let recovered = model.distance(f64::from(value), DEFAULT_QUOTE).unwrap();
        assert!((recovered - 3.0).abs() < 1e-3, "recovered {}", recovered);
    }

    #[test]
    fn test_reading_out_of_range() {
        assert!(reading_for(&model(), 1.0e12, 1.0).is_none());
    }

    #[test]
    fn test_one_beacon_per_entry() {
        let config = ConfigFile::default();
        let beacons =
            simulated_beacons(&config, &model(), Point2::new(2.0, 1.5), DEFAULT_QUOTE).unwrap();
        assert_eq!(beacons.len(), config.beacons.len());
        let names: Vec<_> = beacons.iter().map(|b| b.advertisement().label().to_string()).collect();
        assert_eq!(names, vec!["alpha", "bravo", "charlie"]);
    }
}
