//! Per-cycle distance accumulation.
//!
//! The [`FusionStore`] is the only state written by more than one session.
//! Each session records one [`DistanceEstimate`] under its beacon identity;
//! once every configured beacon has reported, the cycle is complete and its
//! record is handed to the solver.
//!
//! ```text
//! session(alpha) ──┐
//! session(bravo) ──┼──► FusionStore ──(complete)──► FusionRecord ──► solver
//! session(charlie)─┘      cycle N                   cycle N+1 starts empty
//! ```
//!
//! The store holds one short-lived lock per write. Completion detection and
//! the drain happen under the same lock as the write that completes the
//! cycle, so exactly one writer observes [`RecordOutcome::Complete`] and
//! writes racing with the drain land in the next cycle.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::beacon::BeaconId;
use crate::estimator::DistanceEstimate;

/// What to do with a negative distance estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NegativeDistancePolicy {
    /// Refuse it; the beacon does not contribute to this cycle.
    #[default]
    Reject,
    /// Record it and let the solver decide.
    PassThrough,
}

impl std::str::FromStr for NegativeDistancePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "pass" | "pass-through" | "passthrough" => Ok(Self::PassThrough),
            other => Err(format!("unknown negative distance policy '{}'", other)),
        }
    }
}

impl std::fmt::Display for NegativeDistancePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reject => f.write_str("reject"),
            Self::PassThrough => f.write_str("pass"),
        }
    }
}

/// Reasons an estimate is not recorded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FusionError {
    /// The beacon is not part of the configured set.
    #[error("beacon '{0}' is not configured")]
    UnknownBeacon(BeaconId),

    /// Negative distance refused by [`NegativeDistancePolicy::Reject`].
    #[error("negative distance {distance} for beacon '{beacon}'")]
    NegativeDistance { beacon: BeaconId, distance: f64 },

    /// NaN or infinite distance.
    #[error("non-finite distance for beacon '{0}'")]
    NonFinite(BeaconId),
}

/// One cycle's estimates keyed by beacon.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusionRecord {
    /// Cycle number, starting at 1.
    pub cycle: u64,
    pub estimates: BTreeMap<BeaconId, DistanceEstimate>,
}

impl FusionRecord {
    fn new(cycle: u64) -> Self {
        Self {
            cycle,
            estimates: BTreeMap::new(),
        }
    }

    /// Number of beacons that have reported.
    pub fn len(&self) -> usize {
        self.estimates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.estimates.is_empty()
    }

    /// Distance recorded for `beacon`, if any.
    pub fn distance(&self, beacon: &BeaconId) -> Option<f64> {
        self.estimates.get(beacon).map(|e| e.distance)
    }
}

/// Result of a successful [`FusionStore::record`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// The cycle still misses some beacons.
    Pending { have: usize, need: usize },
    /// This write completed the cycle; the drained record is returned and a
    /// fresh cycle has started.
    Complete(FusionRecord),
}

/// Shared keyed accumulator of per-beacon distances.
#[derive(Debug)]
pub struct FusionStore {
    expected: BTreeSet<BeaconId>,
    policy: NegativeDistancePolicy,
    current: Mutex<FusionRecord>,
}

impl FusionStore {
    /// Create a store expecting exactly `expected` beacons per cycle.
    pub fn new(
        expected: impl IntoIterator<Item = BeaconId>,
        policy: NegativeDistancePolicy,
    ) -> Self {
        Self {
            expected: expected.into_iter().collect(),
            policy,
            current: Mutex::new(FusionRecord::new(1)),
        }
    }

    /// Number of beacons needed to complete a cycle.
    pub fn threshold(&self) -> usize {
        self.expected.len()
    }

    /// The negative-distance policy in force.
    pub fn policy(&self) -> NegativeDistancePolicy {
        self.policy
    }

    /// Record `estimate` under `beacon` in the active cycle.
    ///
    /// A second estimate for the same beacon in the same cycle overwrites
    /// the first. If this write completes the cycle the record is drained
    /// atomically and returned.
    pub fn record(
        &self,
        beacon: &BeaconId,
        estimate: DistanceEstimate,
    ) -> Result<RecordOutcome, FusionError> {
        if !self.expected.contains(beacon) {
            return Err(FusionError::UnknownBeacon(beacon.clone()));
        }
        if !estimate.distance.is_finite() {
            return Err(FusionError::NonFinite(beacon.clone()));
        }
        if estimate.distance < 0.0 && self.policy == NegativeDistancePolicy::Reject {
            return Err(FusionError::NegativeDistance {
                beacon: beacon.clone(),
                distance: estimate.distance,
            });
        }

        let mut current = self.current.lock();
        current.estimates.insert(beacon.clone(), estimate);
        debug!(
            beacon = %beacon,
            cycle = current.cycle,
            have = current.len(),
            need = self.expected.len(),
            "Estimate recorded"
        );

        if self.covers(&current) {
            let next = FusionRecord::new(current.cycle + 1);
            Ok(RecordOutcome::Complete(std::mem::replace(&mut *current, next)))
        } else {
            Ok(RecordOutcome::Pending {
                have: current.len(),
                need: self.expected.len(),
            })
        }
    }

    fn covers(&self, record: &FusionRecord) -> bool {
        !self.expected.is_empty() && self.expected.iter().all(|id| record.estimates.contains_key(id))
    }

    /// Whether the active cycle covers every configured beacon.
    ///
    /// [`record`](Self::record) drains a cycle inside the same critical
    /// section that completes it, so between calls this reads false.
    pub fn is_complete(&self) -> bool {
        self.covers(&self.current.lock())
    }

    /// Take the active record and start a fresh, empty cycle.
    pub fn drain_and_reset(&self) -> FusionRecord {
        let mut current = self.current.lock();
        let next = FusionRecord::new(current.cycle + 1);
        std::mem::replace(&mut *current, next)
    }

    /// Beacons that have not reported in the active cycle.
    pub fn pending(&self) -> Vec<BeaconId> {
        let current = self.current.lock();
        self.expected
            .iter()
            .filter(|id| !current.estimates.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Number of the active cycle.
    pub fn cycle(&self) -> u64 {
        self.current.lock().cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    fn ids() -> Vec<BeaconId> {
        vec!["alpha".into(), "bravo".into(), "charlie".into()]
    }

    fn est(id: &str, d: f64) -> DistanceEstimate {
        DistanceEstimate {
            beacon: id.into(),
            distance: d,
            computed_at: Utc::now(),
        }
    }

    fn store() -> FusionStore {
        FusionStore::new(ids(), NegativeDistancePolicy::Reject)
    }

    #[test]
    fn test_subset_never_completes() {
        let store = store();
        assert_eq!(
            store.record(&"alpha".into(), est("alpha", 1.0)),
            Ok(RecordOutcome::Pending { have: 1, need: 3 })
        );
        assert!(matches!(
            store.record(&"bravo".into(), est("bravo", 2.0)),
            Ok(RecordOutcome::Pending { have: 2, need: 3 })
        ));
        assert!(!store.is_complete());
        assert_eq!(store.pending(), vec![BeaconId::new("charlie")]);
    }

    #[test]
    fn test_full_set_completes_and_resets() {
        let store = store();
        store.record(&"alpha".into(), est("alpha", 1.0)).unwrap();
        store.record(&"bravo".into(), est("bravo", 2.0)).unwrap();
        let outcome = store.record(&"charlie".into(), est("charlie", 3.0)).unwrap();

        let RecordOutcome::Complete(record) = outcome else {
            panic!("cycle should be complete");
        };
        assert_eq!(record.cycle, 1);
        assert_eq!(record.len(), 3);
        assert_eq!(record.distance(&"bravo".into()), Some(2.0));

        assert_eq!(store.cycle(), 2);
        assert_eq!(store.pending().len(), 3);
    }

    #[test]
    fn test_duplicate_overwrites() {
        let store = store();
        store.record(&"alpha".into(), est("alpha", 1.0)).unwrap();
        let outcome = store.record(&"alpha".into(), est("alpha", 9.0)).unwrap();
        assert_eq!(outcome, RecordOutcome::Pending { have: 1, need: 3 });

        store.record(&"bravo".into(), est("bravo", 2.0)).unwrap();
        let RecordOutcome::Complete(record) =
            store.record(&"charlie".into(), est("charlie", 3.0)).unwrap()
        else {
            panic!("cycle should be complete");
        };
        assert_eq!(record.distance(&"alpha".into()), Some(9.0));
    }

    #[test]
    fn test_unknown_beacon_rejected_without_corruption() {
        let store = store();
        store.record(&"alpha".into(), est("alpha", 1.0)).unwrap();
        store.record(&"bravo".into(), est("bravo", 2.0)).unwrap();

        let result = store.record(&"delta".into(), est("delta", 4.0));
        assert_eq!(result, Err(FusionError::UnknownBeacon("delta".into())));
        assert_eq!(store.pending(), vec![BeaconId::new("charlie")]);
    }

    #[test]
    fn test_negative_distance_policy() {
        let reject = store();
        assert!(matches!(
            reject.record(&"alpha".into(), est("alpha", -1.0)),
            Err(FusionError::NegativeDistance { .. })
        ));
        assert_eq!(reject.pending().len(), 3);

        let pass = FusionStore::new(ids(), NegativeDistancePolicy::PassThrough);
        assert!(pass.record(&"alpha".into(), est("alpha", -1.0)).is_ok());
    }

    #[test]
    fn test_non_finite_rejected() {
        let store = FusionStore::new(ids(), NegativeDistancePolicy::PassThrough);
        assert_eq!(
            store.record(&"alpha".into(), est("alpha", f64::NAN)),
            Err(FusionError::NonFinite("alpha".into()))
        );
    }

    #[test]
    fn test_manual_drain() {
        let store = store();
        store.record(&"alpha".into(), est("alpha", 1.0)).unwrap();
        let record = store.drain_and_reset();
        assert_eq!(record.len(), 1);
        assert_eq!(record.cycle, 1);
        assert_eq!(store.cycle(), 2);
        assert!(store.pending().contains(&"alpha".into()));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("reject".parse::<NegativeDistancePolicy>(), Ok(NegativeDistancePolicy::Reject));
        assert_eq!(" PASS ".parse::<NegativeDistancePolicy>(), Ok(NegativeDistancePolicy::PassThrough));
        assert!("maybe".parse::<NegativeDistancePolicy>().is_err());
    }

    #[test]
    fn test_concurrent_writers_complete_exactly_once() {
        for _ in 0..50 {
            let store = Arc::new(store());
            let handles: Vec<_> = ids()
                .into_iter()
                .map(|id| {
                    let store = Arc::clone(&store);
                    std::thread::spawn(move || {
                        let d = est(id.as_str(), 1.0);
                        store.record(&id, d).unwrap()
                    })
                })
                .collect();

            let completions = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|o| matches!(o, RecordOutcome::Complete(_)))
                .count();
            assert_eq!(completions, 1);
            assert_eq!(store.cycle(), 2);
        }
    }
}
