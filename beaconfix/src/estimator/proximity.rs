//! RSSI proximity classification.
//!
//! A log-distance path-loss model turns an advertisement's signal strength
//! into a rough range, which is then bucketed into a [`Proximity`] class for
//! the periodic broadcast payload:
//!
//! ```text
//! range = 10 ^ ((tx_power - rssi) / (10 * n))
//! ```

use serde::{Deserialize, Serialize};

/// Calibrated RSSI at one meter, dBm.
pub const DEFAULT_TX_POWER: f64 = -59.0;

/// Free-space path-loss exponent.
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 2.0;

/// Upper bound (meters) of [`Proximity::Immediate`].
pub const IMMEDIATE_RANGE: f64 = 0.5;

/// Upper bound (meters) of [`Proximity::Near`].
pub const NEAR_RANGE: f64 = 3.0;

/// Coarse proximity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proximity {
    Immediate,
    Near,
    Far,
    Unknown,
}

impl Proximity {
    /// Classify a range in meters.
    pub fn from_range(range: f64) -> Self {
        if !range.is_finite() {
            Self::Unknown
        } else if range < IMMEDIATE_RANGE {
            Self::Immediate
        } else if range < NEAR_RANGE {
            Self::Near
        } else {
            Self::Far
        }
    }
}

/// Log-distance path-loss model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathLossModel {
    pub tx_power: f64,
    pub exponent: f64,
}

impl Default for PathLossModel {
    fn default() -> Self {
        Self {
            tx_power: DEFAULT_TX_POWER,
            exponent: DEFAULT_PATH_LOSS_EXPONENT,
        }
    }
}

impl PathLossModel {
    /// Estimated range in meters, or `None` for a non-negative RSSI.
    pub fn range(&self, rssi: i16) -> Option<f64> {
        if rssi >= 0 {
            return None;
        }
        let exponent = (self.tx_power - f64::from(rssi)) / (10.0 * self.exponent);
        Some(10f64.powf(exponent))
    }

    /// Proximity class of an advertisement with the given RSSI.
    pub fn classify(&self, rssi: Option<i16>) -> Proximity {
        rssi.and_then(|r| self.range(r))
            .map(Proximity::from_range)
            .unwrap_or(Proximity::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_at_tx_power_is_one_meter() {
        let model = PathLossModel::default();
        assert!((model.range(-59).unwrap() - 1.0).abs() < 1e-12);
        assert!((model.range(-79).unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_negative_rssi_rejected() {
        let model = PathLossModel::default();
        assert_eq!(model.range(0), None);
        assert_eq!(model.range(5), None);
        assert_eq!(model.classify(Some(0)), Proximity::Unknown);
    }

    #[test]
    fn test_classification() {
        let model = PathLossModel::default();
        assert_eq!(model.classify(Some(-45)), Proximity::Immediate);
        assert_eq!(model.classify(Some(-62)), Proximity::Near);
        assert_eq!(model.classify(Some(-80)), Proximity::Far);
        assert_eq!(model.classify(None), Proximity::Unknown);
    }

    #[test]
    fn test_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Proximity::Near).unwrap(),
            "\"near\""
        );
    }
}
