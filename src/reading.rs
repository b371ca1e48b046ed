//! Typed readings produced by the crate links.
//!
//! Readings are plain values: once a codec has parsed a reply they are never
//! mutated, only merged into a [`Snapshot`](crate::snapshot::Snapshot).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value substituted for every rail of a link that could not be reached.
pub const SENTINEL: f64 = -1.0;

/// One of the two physical halves of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    North,
    South,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::North, Side::South];

    /// Position of the side in mapping files and in the absolute board range.
    pub fn index(self) -> usize {
        match self {
            Side::North => 0,
            Side::South => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Side::North),
            1 => Some(Side::South),
            _ => None,
        }
    }

    /// Absolute index of the first board on this side.
    pub fn board_offset(self, boards_per_side: usize) -> usize {
        self.index() * boards_per_side
    }

    /// Side owning an absolute board index, with the board's local index.
    pub fn locate(board: usize, boards_per_side: usize) -> Option<(Side, usize)> {
        if boards_per_side == 0 {
            return None;
        }
        Side::from_index(board / boards_per_side).map(|side| (side, board % boards_per_side))
    }

    pub fn name(self) -> &'static str {
        match self {
            Side::North => "north",
            Side::South => "south",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Interface board rail voltages, in volts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageTriple {
    pub positive: f64,
    pub negative: f64,
    pub bias: f64,
}

/// Positive/negative rail pair.
///
/// Used for the low-voltage crate's per-channel voltages (V) and currents (A).
/// The unit belongs to the subsystem, not to the sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RailPair {
    pub positive: f64,
    pub negative: f64,
}

impl RailPair {
    pub const SENTINEL: RailPair = RailPair {
        positive: SENTINEL,
        negative: SENTINEL,
    };

    pub fn is_sentinel(&self) -> bool {
        *self == Self::SENTINEL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    On,
    Off,
}

/// One bias crate channel as reported by the external status command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasChannelStatus {
    pub channel: String,
    /// Setpoint in volts.
    pub setpoint: f64,
    /// Readback in volts.
    pub readback: f64,
    /// Trip limit in microamps.
    pub current_limit: f64,
    /// Current readback in microamps.
    pub current_readback: f64,
    pub state: ChannelState,
    pub ok: bool,
}

/// Per-board amplifier gain setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GainMode {
    Normal,
    High,
}

impl GainMode {
    pub fn as_metric(self) -> f64 {
        match self {
            GainMode::Normal => 0.0,
            GainMode::High => 1.0,
        }
    }
}
