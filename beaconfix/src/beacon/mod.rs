//! Beacon identities and the static beacon table.
//!
//! Beacons are fixed anchors with a surveyed position. They are provided as
//! static configuration and never created or destroyed at runtime; the radio
//! layer only ever *finds* them.
//!
//! # Identity Matching
//!
//! A peripheral discovered at runtime is matched against the table by its
//! advertised local name, falling back to its address. Both sides are
//! normalized the same way before comparison:
//!
//! - surrounding whitespace is trimmed
//! - ASCII letters are compared case-insensitively
//!
//! So a peripheral advertising `"  Beacon-A "` matches a table entry
//! configured as `beacon-a`, and address `AA:BB:CC:DD:EE:FF` matches
//! `aa:bb:cc:dd:ee:ff`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coord::Point2;

/// Normalized beacon identity.
///
/// Construction always normalizes, so two `BeaconId`s compare equal exactly
/// when their raw identities match under the rule described in the module
/// documentation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BeaconId(String);

impl BeaconId {
    /// Create an identity from a raw name or address.
    pub fn new(raw: &str) -> Self {
        Self(normalize_identity(raw))
    }

    /// The normalized identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identity is empty after normalization.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for BeaconId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BeaconId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Normalize a raw beacon name or address for comparison.
pub fn normalize_identity(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// A fixed-position beacon used as a trilateration anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct Beacon {
    /// Normalized identity.
    pub id: BeaconId,
    /// Surveyed position in room coordinates (meters).
    pub position: Point2,
}

impl Beacon {
    /// Create a beacon at the given position.
    pub fn new(id: impl Into<BeaconId>, position: Point2) -> Self {
        Self {
            id: id.into(),
            position,
        }
    }
}

/// Errors raised while building a [`BeaconSet`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BeaconSetError {
    /// Two entries normalize to the same identity.
    #[error("duplicate beacon identity '{0}'")]
    Duplicate(BeaconId),

    /// An entry has an empty identity after normalization.
    #[error("beacon identity must not be empty")]
    EmptyIdentity,

    /// An entry has a non-finite position.
    #[error("beacon '{id}' has a non-finite position {position}")]
    InvalidPosition { id: BeaconId, position: Point2 },
}

/// The configured beacon table.
///
/// Entries are kept ordered by identity so iteration (and therefore the
/// order anchors are handed to the solver) is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeaconSet {
    beacons: BTreeMap<BeaconId, Beacon>,
}

impl BeaconSet {
    /// Build a beacon table, rejecting duplicate or empty identities.
    pub fn new(beacons: impl IntoIterator<Item = Beacon>) -> Result<Self, BeaconSetError> {
        let mut table = BTreeMap::new();
        for beacon in beacons {
            if beacon.id.is_empty() {
                return Err(BeaconSetError::EmptyIdentity);
            }
            if !beacon.position.is_finite() {
                return Err(BeaconSetError::InvalidPosition {
                    id: beacon.id,
                    position: beacon.position,
                });
            }
            if table.contains_key(&beacon.id) {
                return Err(BeaconSetError::Duplicate(beacon.id));
            }
            table.insert(beacon.id.clone(), beacon);
        }
        Ok(Self { beacons: table })
    }

    /// Look up a beacon by identity.
    pub fn get(&self, id: &BeaconId) -> Option<&Beacon> {
        self.beacons.get(id)
    }

    /// Whether the identity is part of the table.
    pub fn contains(&self, id: &BeaconId) -> bool {
        self.beacons.contains_key(id)
    }

    /// Match a discovered peripheral against the table.
    ///
    /// The advertised local name is tried first, then the address.
    pub fn resolve(&self, local_name: Option<&str>, address: &str) -> Option<&Beacon> {
        local_name
            .and_then(|name| self.get(&BeaconId::new(name)))
            .or_else(|| self.get(&BeaconId::new(address)))
    }

    /// Iterate beacons in identity order.
    pub fn iter(&self) -> impl Iterator<Item = &Beacon> {
        self.beacons.values()
    }

    /// Iterate identities in order.
    pub fn ids(&self) -> impl Iterator<Item = &BeaconId> {
        self.beacons.keys()
    }

    /// Number of configured beacons.
    pub fn len(&self) -> usize {
        self.beacons.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.beacons.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> BeaconSet {
        BeaconSet::new(vec![
            Beacon::new("alpha", Point2::new(0.0, 0.0)),
            Beacon::new("Bravo", Point2::new(5.0, 0.0)),
            Beacon::new("AA:BB:CC:DD:EE:FF", Point2::new(2.0, 4.0)),
        ])
        .unwrap()
    }

    #[test]
    fn test_normalization_trims_and_lowercases() {
        assert_eq!(normalize_identity("  Beacon-A \t"), "beacon-a");
        assert_eq!(BeaconId::new("ALPHA"), BeaconId::new(" alpha "));
    }

    #[test]
    fn test_normalization_keeps_inner_whitespace() {
        assert_ne!(BeaconId::new("beacon a"), BeaconId::new("beacona"));
    }

    #[test]
    fn test_resolve_by_name_case_insensitive() {
        let set = table();
        let beacon = set.resolve(Some(" BRAVO "), "00:00:00:00:00:01").unwrap();
        assert_eq!(beacon.id.as_str(), "bravo");
    }

    #[test]
    fn test_resolve_falls_back_to_address() {
        let set = table();
        let beacon = set.resolve(Some("unknown"), "aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(beacon.position, Point2::new(2.0, 4.0));

        let beacon = set.resolve(None, "AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(beacon.id.as_str(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_resolve_unknown_peripheral() {
        let set = table();
        assert!(set.resolve(Some("charlie"), "11:22:33:44:55:66").is_none());
    }

    #[test]
    fn test_duplicate_after_normalization_rejected() {
        let result = BeaconSet::new(vec![
            Beacon::new("alpha", Point2::origin()),
            Beacon::new(" ALPHA", Point2::new(1.0, 1.0)),
        ]);
        assert_eq!(
            result,
            Err(BeaconSetError::Duplicate(BeaconId::new("alpha")))
        );
    }

    #[test]
    fn test_empty_identity_rejected() {
        let result = BeaconSet::new(vec![Beacon::new("   ", Point2::origin())]);
        assert_eq!(result, Err(BeaconSetError::EmptyIdentity));
    }

    #[test]
    fn test_non_finite_position_rejected() {
        let result = BeaconSet::new(vec![Beacon::new("a", Point2::new(f64::NAN, 0.0))]);
        assert!(matches!(
            result,
            Err(BeaconSetError::InvalidPosition { .. })
        ));
    }

    #[test]
    fn test_iteration_is_ordered_by_identity() {
        let set = table();
        let ids: Vec<_> = set.ids().map(|id| id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["aa:bb:cc:dd:ee:ff", "alpha", "bravo"]);
    }
}
