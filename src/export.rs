//! Flattening of a [`Snapshot`] into labelled samples for a metrics exporter.
//!
//! This is where "board is off" readings are filtered out, using the named
//! [`ExportThresholds`]; the scheduler itself stores raw values. Per-sensor
//! interface readings are labelled with their detector coordinate, and
//! channels the map does not know are skipped.

use crate::channel_map::{ChannelMap, INTERFACE_BOARDS};
use crate::config::ExportThresholds;
use crate::reading::{ChannelState, RailPair, Side};
use crate::snapshot::{Readings, Snapshot};
use serde::Serialize;
use std::collections::BTreeMap;

const BOARDS_PER_SIDE: usize = INTERFACE_BOARDS / 2;

/// One exported value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub metric: &'static str,
    pub unit: &'static str,
    pub labels: BTreeMap<&'static str, String>,
    pub value: f64,
}

impl Sample {
    fn new(metric: &'static str, unit: &'static str, value: f64) -> Self {
        Self {
            metric,
            unit,
            labels: BTreeMap::new(),
            value,
        }
    }

    fn label(mut self, name: &'static str, value: impl ToString) -> Self {
        self.labels.insert(name, value.to_string());
        self
    }
}

pub fn samples(
    snapshot: &Snapshot,
    map: &ChannelMap,
    thresholds: &ExportThresholds,
) -> Vec<Sample> {
    let mut out = Vec::new();

    if let Some(temperatures) = &snapshot.temperatures {
        per_tile(&mut out, temperatures, map, "temperatures", "C", |t| {
            t < thresholds.temperature_off_below
        });
    }
    if let Some(currents) = &snapshot.interface_currents {
        per_tile(&mut out, currents, map, "currents", "uA", |i| {
            i > thresholds.current_off_above
        });
    }

    if let Some(voltages) = &snapshot.interface_voltages {
        for (&board, triple) in &voltages.boards {
            if triple.positive > thresholds.voltage_off_above {
                continue;
            }
            let Some((side, interface)) = Side::locate(board, BOARDS_PER_SIDE) else {
                continue;
            };
            for (rail, value) in [
                ("positive", triple.positive),
                ("negative", triple.negative),
                ("bias", triple.bias),
            ] {
                out.push(
                    Sample::new("voltages", "V", value)
                        .label("side", side)
                        .label("interface", interface)
                        .label("rail", rail),
                );
            }
        }
    }

    if let Some(gains) = &snapshot.gain_modes {
        for (&board, mode) in &gains.boards {
            if let Some((side, interface)) = Side::locate(board, BOARDS_PER_SIDE) {
                out.push(
                    Sample::new("gain_mode", "", mode.as_metric())
                        .label("side", side)
                        .label("interface", interface),
                );
            }
        }
    }

    if let Some(lv) = &snapshot.lv_voltages {
        per_rail(&mut out, lv, "lv_voltages", "V");
    }
    if let Some(lv) = &snapshot.lv_currents {
        per_rail(&mut out, lv, "lv_currents", "A");
    }

    if let Some(bias) = &snapshot.bias {
        for (channel, status) in &bias.boards {
            let state = match status.state {
                ChannelState::On => 1.0,
                ChannelState::Off => 0.0,
            };
            let ok = if status.ok { 1.0 } else { 0.0 };
            for (metric, unit, value) in [
                ("bias_setpoint", "V", status.setpoint),
                ("bias_readback", "V", status.readback),
                ("current_limit", "uA", status.current_limit),
                ("current_readback", "uA", status.current_readback),
                ("channel_state", "", state),
                ("channel_okay", "", ok),
            ] {
                out.push(Sample::new(metric, unit, value).label("channel", channel));
            }
        }
    }

    out
}

fn per_tile(
    out: &mut Vec<Sample>,
    readings: &Readings<Vec<f64>>,
    map: &ChannelMap,
    metric: &'static str,
    unit: &'static str,
    board_off: impl Fn(f64) -> bool,
) {
    for (&board, values) in &readings.boards {
        for (channel, &value) in values.iter().enumerate() {
            if board_off(value) {
                continue;
            }
            let Some(coord) = map.lookup(board, channel) else {
                continue;
            };
            out.push(
                Sample::new(metric, unit, value)
                    .label("side", coord.side)
                    .label("sector", coord.sector)
                    .label("tile", coord.tile),
            );
        }
    }
}

fn per_rail(
    out: &mut Vec<Sample>,
    readings: &Readings<Vec<RailPair>>,
    metric: &'static str,
    unit: &'static str,
) {
    for (&board, rails) in &readings.boards {
        for (channel, pair) in rails.iter().enumerate() {
            for (rail, value) in [("positive", pair.positive), ("negative", pair.negative)] {
                out.push(
                    Sample::new(metric, unit, value)
                        .label("board", board)
                        .label("channel", channel)
                        .label("rail", rail),
                );
            }
        }
    }
}
