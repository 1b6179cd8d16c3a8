//! Distance estimation.
//!
//! A beacon's reading is treated as a *historical* value of some quantity
//! and the freshly fetched reference quote as its *current* value. Both are
//! assumed to grow at a constant continuous annual rate `r`, so the ratio
//! between them implies an elapsed time, and the elapsed time times a
//! propagation speed gives a distance:
//!
//! ```text
//! r        = ln(1 + annual_growth_fraction)
//! years    = ln(current / historical) / r
//! seconds  = years * seconds_per_year
//! distance = seconds * propagation_speed
//! ```
//!
//! The result is a plain real number. It is negative when the current
//! value is below the historical one; whether that is acceptable input to
//! the solver is decided downstream by a
//! [`NegativeDistancePolicy`](crate::fusion::NegativeDistancePolicy).
//!
//! [`proximity`] holds the separate RSSI path-loss model used for the
//! coarse proximity entries in the periodic broadcast.

pub mod proximity;

pub use proximity::{PathLossModel, Proximity};

use chrono::{DateTime, Utc};

use crate::beacon::BeaconId;
use crate::quote::{QuoteError, ReferenceQuote};
use crate::session::RawReading;

/// Seconds in a Julian year (365.2425 days).
pub const JULIAN_YEAR_SECS: f64 = 31_556_952.0;

/// Speed of light in vacuum, m/s. The default propagation speed.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Default annual growth fraction (49%).
pub const DEFAULT_ANNUAL_GROWTH: f64 = 0.49;

/// Constants of the growth-rate distance model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthModel {
    /// Continuous annual growth rate, `ln(1 + fraction)`.
    pub growth_rate: f64,
    /// Distance units per second.
    pub propagation_speed: f64,
    /// Seconds per model year.
    pub seconds_per_year: f64,
}

impl Default for GrowthModel {
    fn default() -> Self {
        Self::from_annual_fraction(DEFAULT_ANNUAL_GROWTH)
    }
}

impl GrowthModel {
    /// Model growing by `fraction` per year (0.49 = 49%).
    pub fn from_annual_fraction(fraction: f64) -> Self {
        Self {
            growth_rate: fraction.ln_1p(),
            propagation_speed: SPEED_OF_LIGHT,
            seconds_per_year: JULIAN_YEAR_SECS,
        }
    }

    /// Override the propagation speed.
    pub fn with_propagation_speed(mut self, speed: f64) -> Self {
        self.propagation_speed = speed;
        self
    }

    /// Override the length of a model year.
    pub fn with_seconds_per_year(mut self, seconds: f64) -> Self {
        self.seconds_per_year = seconds;
        self
    }

    /// Distance implied by a historical and a current value.
    ///
    /// # Errors
    ///
    /// [`QuoteError::InvalidQuote`] if either value is non-positive or not
    /// finite.
    pub fn distance(&self, historical: f64, current: f64) -> Result<f64, QuoteError> {
        let valid = |v: f64| v.is_finite() && v > 0.0;
        if !valid(current) || !valid(historical) {
            return Err(QuoteError::InvalidQuote {
                current,
                historical,
            });
        }
        if current == historical {
            return Ok(0.0);
        }

        let years = (current / historical).ln() / self.growth_rate;
        Ok(years * self.seconds_per_year * self.propagation_speed)
    }

    /// Historical value that yields `distance` against `current`.
    ///
    /// Inverse of [`distance`](Self::distance); used to program simulated
    /// beacons.
    pub fn historical_for_distance(&self, current: f64, distance: f64) -> f64 {
        let years = distance / self.propagation_speed / self.seconds_per_year;
        current / (self.growth_rate * years).exp()
    }
}

/// One beacon's distance for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceEstimate {
    pub beacon: BeaconId,
    pub distance: f64,
    pub computed_at: DateTime<Utc>,
}

/// Converts readings plus quotes into distances.
#[derive(Debug, Clone, Default)]
pub struct DistanceEstimator {
    model: GrowthModel,
}

impl DistanceEstimator {
    pub fn new(model: GrowthModel) -> Self {
        Self { model }
    }

    /// The model in use.
    pub fn model(&self) -> &GrowthModel {
        &self.model
    }

    /// Estimate the distance to the beacon that produced `reading`.
    pub fn estimate(
        &self,
        reading: &RawReading,
        quote: &ReferenceQuote,
    ) -> Result<DistanceEstimate, QuoteError> {
        let distance = self.model.distance(f64::from(reading.value), quote.value)?;
        Ok(DistanceEstimate {
            beacon: reading.beacon.clone(),
            distance,
            computed_at: Utc::now(),
        })
    }
}
