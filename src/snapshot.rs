//! The merged, last-known-good view of every subsystem.
//!
//! Each subsystem is an independently optional field: `None` means it has not
//! been polled successfully since the process started and must not be
//! fabricated by consumers. A present subsystem carries its own capture time
//! because subsystems refresh on different cadences.

use crate::reading::{BiasChannelStatus, GainMode, RailPair, VoltageTriple};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Readings of one subsystem keyed by board (or channel id).
///
/// Every key present maps to a complete reading; a board whose reply failed
/// is absent from a poll result and keeps its previous value on merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Readings<T, K: Ord = usize> {
    pub captured_at: DateTime<Utc>,
    pub boards: BTreeMap<K, T>,
}

impl<T, K: Ord> Readings<T, K> {
    pub fn new(captured_at: DateTime<Utc>, boards: BTreeMap<K, T>) -> Self {
        Self {
            captured_at,
            boards,
        }
    }

    pub fn get(&self, key: &K) -> Option<&T> {
        self.boards.get(key)
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }
}

/// Merge a poll result into a subsystem slot.
///
/// Boards in `fresh` overwrite their previous values; boards missing from
/// `fresh` keep the previous ones. An empty result leaves the slot untouched,
/// including its capture time. Returns whether anything was merged.
pub fn merge<T, K: Ord>(
    slot: &mut Option<Readings<T, K>>,
    fresh: BTreeMap<K, T>,
    now: DateTime<Utc>,
) -> bool {
    if fresh.is_empty() {
        return false;
    }
    match slot {
        Some(existing) => {
            existing.boards.extend(fresh);
            existing.captured_at = now;
        }
        None => *slot = Some(Readings::new(now, fresh)),
    }
    true
}

/// Replace a subsystem wholesale (bias table, LV sentinels).
pub fn replace<T, K: Ord>(slot: &mut Option<Readings<T, K>>, fresh: BTreeMap<K, T>, now: DateTime<Utc>) {
    *slot = Some(Readings::new(now, fresh));
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Sensor temperatures per interface board (°C)
    pub temperatures: Option<Readings<Vec<f64>>>,
    pub interface_voltages: Option<Readings<VoltageTriple>>,
    /// SiPM currents per interface board (µA)
    pub interface_currents: Option<Readings<Vec<f64>>>,
    pub gain_modes: Option<Readings<GainMode>>,
    /// LV crate channel voltages per board (V)
    pub lv_voltages: Option<Readings<Vec<RailPair>>>,
    /// LV crate channel currents per board (A)
    pub lv_currents: Option<Readings<Vec<RailPair>>>,
    /// Bias crate status keyed by channel id
    pub bias: Option<Readings<BiasChannelStatus, String>>,
}

impl Snapshot {
    /// Names of the subsystems polled at least once.
    pub fn populated(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.temperatures.is_some() {
            names.push("temperatures");
        }
        if self.interface_voltages.is_some() {
            names.push("interface_voltages");
        }
        if self.interface_currents.is_some() {
            names.push("interface_currents");
        }
        if self.gain_modes.is_some() {
            names.push("gain_modes");
        }
        if self.lv_voltages.is_some() {
            names.push("lv_voltages");
        }
        if self.lv_currents.is_some() {
            names.push("lv_currents");
        }
        if self.bias.is_some() {
            names.push("bias");
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn merge_keeps_stale_boards_and_refreshes_time() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);
        let mut slot: Option<Readings<f64>> = None;

        assert!(!merge(&mut slot, BTreeMap::new(), t0));
        assert!(slot.is_none());

        assert!(merge(&mut slot, BTreeMap::from([(0, 1.0), (1, 2.0)]), t0));
        assert!(merge(&mut slot, BTreeMap::from([(1, 3.0)]), t1));

        let readings = slot.unwrap();
        assert_eq!(readings.captured_at, t1);
        assert_eq!(readings.get(&0), Some(&1.0));
        assert_eq!(readings.get(&1), Some(&3.0));
    }

    #[test]
    fn empty_result_does_not_touch_capture_time() {
        let t0 = Utc::now();
        let mut slot = Some(Readings::new(t0, BTreeMap::from([(0, 1.0)])));
        assert!(!merge(&mut slot, BTreeMap::new(), t0 + Duration::seconds(1)));
        assert_eq!(slot.unwrap().captured_at, t0);
    }

    #[test]
    fn populated_lists_present_subsystems() {
        let mut snapshot = Snapshot::default();
        assert!(snapshot.populated().is_empty());
        replace(&mut snapshot.gain_modes, BTreeMap::from([(0, GainMode::High)]), Utc::now());
        assert_eq!(snapshot.populated(), vec!["gain_modes"]);
    }
}
