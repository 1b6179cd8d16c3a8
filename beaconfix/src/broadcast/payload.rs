//! Broadcast payload schema.
//!
//! Every payload is a JSON object tagged by `type`:
//!
//! ```text
//! {"type":"hello","service":"beaconfix","version":"0.1.0"}
//! {"type":"heartbeat","t":1718000000,"beacons":[{"id":"alpha","proximity":"near","rssi":-61}]}
//! {"type":"position","t":1718000000,"cycle":7,"x":2.0,"y":2.0,"distances":{"alpha":2.83}}
//! {"type":"unresolved","t":1718000000,"cycle":8,"reason":"anchors are collinear ..."}
//! ```

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::beacon::BeaconId;
use crate::coord::Point2;
use crate::estimator::Proximity;
use crate::fusion::FusionRecord;

/// Latest proximity of one beacon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityEntry {
    pub id: BeaconId,
    pub proximity: Proximity,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rssi: Option<i16>,
}

/// A message delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// First payload on every subscription.
    Hello { service: String, version: String },

    /// Periodic per-subscriber payload.
    Heartbeat {
        t: i64,
        beacons: Vec<ProximityEntry>,
    },

    /// A resolved position for one fusion cycle.
    Position {
        t: i64,
        cycle: u64,
        x: f64,
        y: f64,
        distances: BTreeMap<BeaconId, f64>,
    },

    /// A fusion cycle whose solve failed.
    Unresolved { t: i64, cycle: u64, reason: String },
}

fn now() -> i64 {
    Utc::now().timestamp()
}

impl Payload {
    pub fn hello() -> Self {
        Self::Hello {
            service: crate::SERVICE_NAME.to_string(),
            version: crate::VERSION.to_string(),
        }
    }

    pub fn heartbeat(beacons: Vec<ProximityEntry>) -> Self {
        Self::Heartbeat { t: now(), beacons }
    }

    pub fn position(record: &FusionRecord, point: Point2) -> Self {
        Self::Position {
            t: now(),
            cycle: record.cycle,
            x: point.x,
            y: point.y,
            distances: record
                .estimates
                .iter()
                .map(|(id, e)| (id.clone(), e.distance))
                .collect(),
        }
    }

    pub fn unresolved(cycle: u64, reason: impl std::fmt::Display) -> Self {
        Self::Unresolved {
            t: now(),
            cycle,
            reason: reason.to_string(),
        }
    }

    /// Payload type tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Position { .. } => "position",
            Self::Unresolved { .. } => "unresolved",
        }
    }

    /// Encode as a JSON text frame body.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::DistanceEstimate;
    use serde_json::Value;

    #[test]
    fn test_hello_shape() {
        let json: Value = serde_json::to_value(Payload::hello()).unwrap();
        assert_eq!(json["type"], "hello");
        assert_eq!(json["service"], "beaconfix");
        assert!(json["version"].is_string());
    }

    #[test]
    fn test_heartbeat_shape() {
        let payload = Payload::heartbeat(vec![ProximityEntry {
            id: "alpha".into(),
            proximity: Proximity::Near,
            rssi: Some(-61),
        }]);
        let json: Value = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert!(json["t"].is_i64());
        assert_eq!(json["beacons"][0]["id"], "alpha");
        assert_eq!(json["beacons"][0]["proximity"], "near");
        assert_eq!(json["beacons"][0]["rssi"], -61);
    }

    #[test]
    fn test_position_includes_distances() {
        let mut record = FusionRecord {
            cycle: 4,
            ..Default::default()
        };
        record.estimates.insert(
            "alpha".into(),
            DistanceEstimate {
                beacon: "alpha".into(),
                distance: 2.5,
                computed_at: Utc::now(),
            },
        );

        let json: Value =
            serde_json::to_value(Payload::position(&record, Point2::new(1.0, 2.0))).unwrap();
        assert_eq!(json["type"], "position");
        assert_eq!(json["cycle"], 4);
        assert_eq!(json["x"], 1.0);
        assert_eq!(json["distances"]["alpha"], 2.5);
    }

    #[test]
    fn test_decode_from_wire() {
        let text = r#"{"type":"unresolved","t":5,"cycle":2,"reason":"collinear"}"#;
        let payload: Payload = serde_json::from_str(text).unwrap();
        assert_eq!(payload.kind(), "unresolved");
        assert_eq!(
            payload,
            Payload::Unresolved {
                t: 5,
                cycle: 2,
                reason: "collinear".into()
            }
        );
    }
}
