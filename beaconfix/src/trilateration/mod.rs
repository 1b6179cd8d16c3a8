//! Planar trilateration.
//!
//! Three circles `(x - xi)² + (y - yi)² = di²` are reduced to a 2×2 linear
//! system by subtracting the second equation from the first and the third
//! from the second:
//!
//! ```text
//! A = 2(x2-x1)   B = 2(y2-y1)   C = d1²-d2² - x1²+x2² - y1²+y2²
//! D = 2(x3-x2)   E = 2(y3-y2)   F = d2²-d3² - x2²+x3² - y2²+y3²
//!
//! x = (C·E - F·B) / (E·A - B·D)
//! y = (C·D - A·F) / (B·D - A·E)
//! ```
//!
//! The denominator vanishes when the anchors are collinear, coincident or
//! two of them share a position. Such input is reported as
//! [`DegenerateGeometryError`] instead of producing infinities or NaN.
//!
//! The solver is a pure function of its input.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::beacon::{BeaconId, BeaconSet};
use crate::coord::Point2;
use crate::estimator::DistanceEstimate;
use crate::fusion::FusionRecord;

/// Default threshold below which the system determinant counts as zero.
pub const DEFAULT_DEGENERATE_EPSILON: f64 = 1e-9;

/// Number of anchors the solver consumes.
pub const ANCHOR_COUNT: usize = 3;

/// A known position with a measured distance to the unknown point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub position: Point2,
    pub distance: f64,
}

impl Anchor {
    pub fn new(position: Point2, distance: f64) -> Self {
        Self { position, distance }
    }
}

/// Input the solver cannot resolve.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DegenerateGeometryError {
    /// The anchors are collinear or coincident.
    #[error("anchors are collinear (determinant {determinant:e}, epsilon {epsilon:e})")]
    CollinearAnchors { determinant: f64, epsilon: f64 },

    /// An anchor coordinate or distance is NaN or infinite.
    #[error("anchor input is not finite")]
    NonFiniteInput,

    /// The record does not hold usable anchors.
    #[error("expected {expected} anchors, got {actual}")]
    AnchorCount { expected: usize, actual: usize },
}

/// Solve for the point at distances `d1..d3` from the three anchors.
pub fn solve(
    a1: Anchor,
    a2: Anchor,
    a3: Anchor,
    epsilon: f64,
) -> Result<Point2, DegenerateGeometryError> {
    let finite = |a: &Anchor| a.position.is_finite() && a.distance.is_finite();
    if ![a1, a2, a3].iter().all(finite) {
        return Err(DegenerateGeometryError::NonFiniteInput);
    }

    let (x1, y1, d1) = (a1.position.x, a1.position.y, a1.distance);
    let (x2, y2, d2) = (a2.position.x, a2.position.y, a2.distance);
    let (x3, y3, d3) = (a3.position.x, a3.position.y, a3.distance);

    let a = 2.0 * (x2 - x1);
    let b = 2.0 * (y2 - y1);
    let c = d1 * d1 - d2 * d2 - x1 * x1 + x2 * x2 - y1 * y1 + y2 * y2;
    let d = 2.0 * (x3 - x2);
    let e = 2.0 * (y3 - y2);
    let f = d2 * d2 - d3 * d3 - x2 * x2 + x3 * x3 - y2 * y2 + y3 * y3;

    let determinant = e * a - b * d;
    if determinant.abs() <= epsilon {
        return Err(DegenerateGeometryError::CollinearAnchors {
            determinant,
            epsilon,
        });
    }

    let x = (c * e - f * b) / determinant;
    let y = (c * d - a * f) / (b * d - a * e);
    let point = Point2::new(x, y);
    if !point.is_finite() {
        return Err(DegenerateGeometryError::CollinearAnchors {
            determinant,
            epsilon,
        });
    }
    Ok(point)
}

/// Outcome of one solve attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Position {
    Resolved(Point2),
    Unresolved(DegenerateGeometryError),
}

impl Position {
    pub fn point(&self) -> Option<Point2> {
        match self {
            Self::Resolved(p) => Some(*p),
            Self::Unresolved(_) => None,
        }
    }
}

/// Solver bound to a configured epsilon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrilaterationSolver {
    epsilon: f64,
}

impl Default for TrilaterationSolver {
    fn default() -> Self {
        Self::new(DEFAULT_DEGENERATE_EPSILON)
    }
}

impl TrilaterationSolver {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Solve three anchors.
    pub fn solve(&self, a1: Anchor, a2: Anchor, a3: Anchor) -> Position {
        match solve(a1, a2, a3, self.epsilon) {
            Ok(p) => Position::Resolved(p),
            Err(e) => Position::Unresolved(e),
        }
    }

    /// Solve a completed fusion record against the beacon table.
    ///
    /// Anchors are taken in beacon identity order so the same record always
    /// produces the same result.
    pub fn solve_record(&self, beacons: &BeaconSet, record: &FusionRecord) -> Position {
        match anchors_for(beacons, &record.estimates) {
            Ok([a1, a2, a3]) => self.solve(a1, a2, a3),
            Err(e) => Position::Unresolved(e),
        }
    }
}

fn anchors_for(
    beacons: &BeaconSet,
    estimates: &BTreeMap<BeaconId, DistanceEstimate>,
) -> Result<[Anchor; ANCHOR_COUNT], DegenerateGeometryError> {
    let anchors: Vec<Anchor> = estimates
        .iter()
        .filter_map(|(id, est)| {
            beacons
                .get(id)
                .map(|b| Anchor::new(b.position, est.distance))
        })
        .collect();

    anchors
        .try_into()
        .map_err(|v: Vec<Anchor>| DegenerateGeometryError::AnchorCount {
            expected: ANCHOR_COUNT,
            actual: v.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::Beacon;
    use chrono::Utc;
    use proptest::prelude::*;

    fn anchor(x: f64, y: f64, d: f64) -> Anchor {
        Anchor::new(Point2::new(x, y), d)
    }

    #[test]
    fn test_reference_scenario() {
        let p = solve(
            anchor(0.0, 0.0, 2.828),
            anchor(5.0, 0.0, 3.606),
            anchor(2.0, 4.0, 2.0),
            DEFAULT_DEGENERATE_EPSILON,
        )
        .unwrap();
        assert!((p.x - 2.0).abs() < 1e-2, "x = {}", p.x);
        assert!((p.y - 2.0).abs() < 1e-2, "y = {}", p.y);
    }

    #[test]
    fn test_exact_distances_recover_point() {
        let truth = Point2::new(1.25, -3.5);
        let anchors = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)]
            .map(|(x, y)| anchor(x, y, truth.distance_to(&Point2::new(x, y))));
        let p = solve(anchors[0], anchors[1], anchors[2], DEFAULT_DEGENERATE_EPSILON).unwrap();
        assert!(p.distance_to(&truth) < 1e-9);
    }

    #[test]
    fn test_collinear_rejected() {
        let result = solve(
            anchor(0.0, 0.0, 1.0),
            anchor(1.0, 1.0, 1.0),
            anchor(2.0, 2.0, 1.0),
            DEFAULT_DEGENERATE_EPSILON,
        );
        assert!(matches!(
            result,
            Err(DegenerateGeometryError::CollinearAnchors { .. })
        ));
    }

    #[test]
    fn test_coincident_anchors_rejected() {
        let result = solve(
            anchor(1.0, 1.0, 1.0),
            anchor(1.0, 1.0, 2.0),
            anchor(4.0, 0.0, 3.0),
            DEFAULT_DEGENERATE_EPSILON,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_near_collinear_within_epsilon_rejected() {
        let result = solve(
            anchor(0.0, 0.0, 1.0),
            anchor(1.0, 0.0, 1.0),
            anchor(2.0, 1e-6, 1.0),
            1e-3,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_non_finite_input_rejected() {
        let result = solve(
            anchor(0.0, 0.0, f64::NAN),
            anchor(5.0, 0.0, 1.0),
            anchor(2.0, 4.0, 1.0),
            DEFAULT_DEGENERATE_EPSILON,
        );
        assert_eq!(result, Err(DegenerateGeometryError::NonFiniteInput));
    }

    #[test]
    fn test_solve_record_uses_identity_order() {
        let beacons = BeaconSet::new(vec![
            Beacon::new("a", Point2::new(0.0, 0.0)),
            Beacon::new("b", Point2::new(5.0, 0.0)),
            Beacon::new("c", Point2::new(2.0, 4.0)),
        ])
        .unwrap();

        let mut record = FusionRecord::default();
        for (id, d) in [("c", 2.0), ("a", 2.828), ("b", 3.606)] {
            record.estimates.insert(
                id.into(),
                DistanceEstimate {
                    beacon: id.into(),
                    distance: d,
                    computed_at: Utc::now(),
                },
            );
        }

        let solver = TrilaterationSolver::default();
        let p = solver.solve_record(&beacons, &record).point().unwrap();
        assert!((p.x - 2.0).abs() < 1e-2 && (p.y - 2.0).abs() < 1e-2);
    }

    #[test]
    fn test_solve_record_wrong_count() {
        let beacons = BeaconSet::new(vec![Beacon::new("a", Point2::origin())]).unwrap();
        let position = TrilaterationSolver::default().solve_record(&beacons, &FusionRecord::default());
        assert_eq!(
            position,
            Position::Unresolved(DegenerateGeometryError::AnchorCount {
                expected: 3,
                actual: 0
            })
        );
    }

    mod property_tests {
        use super::*;

        fn finite_anchor() -> impl Strategy<Value = Anchor> {
            (-100.0f64..100.0, -100.0f64..100.0, 0.0f64..200.0)
                .prop_map(|(x, y, d)| anchor(x, y, d))
        }

        proptest! {
            #[test]
            fn solver_is_deterministic(a1 in finite_anchor(), a2 in finite_anchor(), a3 in finite_anchor()) {
                let first = solve(a1, a2, a3, DEFAULT_DEGENERATE_EPSILON);
                let second = solve(a1, a2, a3, DEFAULT_DEGENERATE_EPSILON);
                match (first, second) {
                    (Ok(p), Ok(q)) => {
                        prop_assert_eq!(p.x.to_bits(), q.x.to_bits());
                        prop_assert_eq!(p.y.to_bits(), q.y.to_bits());
                    }
                    (Err(e1), Err(e2)) => prop_assert_eq!(e1, e2),
                    _ => prop_assert!(false, "solver results diverged"),
                }
            }

            #[test]
            fn collinear_always_degenerate(
                x0 in -50i32..50, y0 in -50i32..50,
                dx in -5i32..5, dy in -5i32..5,
                t in proptest::array::uniform3(-10i32..10),
                d in proptest::array::uniform3(0.0f64..100.0),
            ) {
                let at = |i: usize| Point2::new(
                    f64::from(x0 + t[i] * dx),
                    f64::from(y0 + t[i] * dy),
                );
                let result = solve(
                    Anchor::new(at(0), d[0]),
                    Anchor::new(at(1), d[1]),
                    Anchor::new(at(2), d[2]),
                    DEFAULT_DEGENERATE_EPSILON,
                );
                prop_assert!(result.is_err());
            }
        }
    }
}
