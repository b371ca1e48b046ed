//! Static (interface board, channel) <-> (side, sector, tile) table.
//!
//! Built once at startup from a space-delimited mapping file:
//!
//! ```text
//! side sector tile interface_board channel
//! 0 0 0 0 0
//! 0 0 1 0 1
//! ```
//!
//! The first line is a header and is skipped. `side` is `0`/`north` or
//! `1`/`south`. Pairs absent from the file stay unmapped; consumers must skip
//! them rather than treat them as board 0, channel 0.

use crate::error::{ScError, ScResult};
use crate::reading::Side;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

pub const INTERFACE_BOARDS: usize = 12;
pub const CHANNELS_PER_BOARD: usize = 64;
pub const SECTORS: usize = 12;
pub const TILES_PER_SECTOR: usize = 32;

/// Human-meaningful detector coordinate of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TileCoord {
    pub side: Side,
    pub sector: usize,
    pub tile: usize,
}

/// Hardware address of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelAddr {
    pub board: usize,
    pub channel: usize,
}

#[derive(Debug, Clone)]
pub struct ChannelMap {
    forward: Vec<Option<TileCoord>>,
    reverse: HashMap<TileCoord, ChannelAddr>,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            forward: vec![None; INTERFACE_BOARDS * CHANNELS_PER_BOARD],
            reverse: HashMap::new(),
        }
    }
}

impl ChannelMap {
    /// Map with every channel unmapped.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> ScResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ScError::ChannelMap(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> ScResult<Self> {
        let mut map = Self::default();
        for (number, line) in text.lines().enumerate().skip(1) {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (coord, addr) = parse_row(line)
                .map_err(|msg| ScError::ChannelMap(format!("line {}: {msg}", number + 1)))?;
            map.insert(coord, addr)
                .map_err(|msg| ScError::ChannelMap(format!("line {}: {msg}", number + 1)))?;
        }
        Ok(map)
    }

    fn insert(&mut self, coord: TileCoord, addr: ChannelAddr) -> Result<(), String> {
        let slot = &mut self.forward[addr.board * CHANNELS_PER_BOARD + addr.channel];
        if slot.is_some() {
            return Err(format!(
                "board {} channel {} mapped twice",
                addr.board, addr.channel
            ));
        }
        if self.reverse.contains_key(&coord) {
            return Err(format!(
                "{} sector {} tile {} mapped twice",
                coord.side, coord.sector, coord.tile
            ));
        }
        *slot = Some(coord);
        self.reverse.insert(coord, addr);
        Ok(())
    }

    /// Coordinate of a hardware channel, `None` when unmapped or out of range.
    pub fn lookup(&self, board: usize, channel: usize) -> Option<TileCoord> {
        if board >= INTERFACE_BOARDS || channel >= CHANNELS_PER_BOARD {
            return None;
        }
        self.forward[board * CHANNELS_PER_BOARD + channel]
    }

    /// Hardware channel feeding a tile, `None` when unmapped.
    pub fn lookup_tile(&self, side: Side, sector: usize, tile: usize) -> Option<ChannelAddr> {
        self.reverse
            .get(&TileCoord { side, sector, tile })
            .copied()
    }

    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }
}

fn parse_row(line: &str) -> Result<(TileCoord, ChannelAddr), String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, found {}", fields.len()));
    }

    let side = match fields[0].to_lowercase().as_str() {
        "0" | "north" | "n" => Side::North,
        "1" | "south" | "s" => Side::South,
        other => return Err(format!("unknown side '{other}'")),
    };
    let sector = parse_bounded(fields[1], "sector", SECTORS)?;
    let tile = parse_bounded(fields[2], "tile", TILES_PER_SECTOR)?;
    let board = parse_bounded(fields[3], "interface board", INTERFACE_BOARDS)?;
    let channel = parse_bounded(fields[4], "channel", CHANNELS_PER_BOARD)?;

    Ok((
        TileCoord { side, sector, tile },
        ChannelAddr { board, channel },
    ))
}

fn parse_bounded(field: &str, what: &str, limit: usize) -> Result<usize, String> {
    let value: usize = field
        .parse()
        .map_err(|_| format!("{what} '{field}' is not a non-negative integer"))?;
    if value >= limit {
        return Err(format!("{what} {value} out of range 0..{limit}"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "side sector tile interface_board channel\n\
                          0 0 0 0 0\n\
                          0 0 1 0 1\n\
                          1 11 31 11 63\n\
                          south 3 7 8 12\n";

    #[test]
    fn forward_and_reverse_are_inverses() {
        let map = ChannelMap::parse(SAMPLE).unwrap();
        assert_eq!(map.len(), 4);

        for line in SAMPLE.lines().skip(1) {
            let (coord, addr) = parse_row(line).unwrap();
            assert_eq!(map.lookup(addr.board, addr.channel), Some(coord));
            assert_eq!(
                map.lookup_tile(coord.side, coord.sector, coord.tile),
                Some(addr)
            );
        }
    }

    #[test]
    fn absent_pairs_are_unmapped_not_zero() {
        let map = ChannelMap::parse(SAMPLE).unwrap();
        assert_eq!(map.lookup(0, 2), None);
        assert_eq!(map.lookup(5, 0), None);
        assert_eq!(map.lookup(12, 0), None);
        assert_eq!(map.lookup_tile(Side::North, 5, 5), None);
        assert!(ChannelMap::empty().lookup(0, 0).is_none());
    }

    #[test]
    fn rejects_bad_rows() {
        let header = "side sector tile interface_board channel\n";
        assert!(ChannelMap::parse(&format!("{header}0 0 0 0\n")).is_err());
        assert!(ChannelMap::parse(&format!("{header}2 0 0 0 0\n")).is_err());
        assert!(ChannelMap::parse(&format!("{header}0 0 0 12 0\n")).is_err());
        assert!(ChannelMap::parse(&format!("{header}0 0 32 0 0\n")).is_err());
        assert!(ChannelMap::parse(&format!("{header}0 0 0 0 0\n0 0 1 0 0\n")).is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.txt");
        std::fs::write(&path, SAMPLE).unwrap();

        let map = ChannelMap::load(&path).unwrap();
        assert_eq!(
            map.lookup(8, 12),
            Some(TileCoord {
                side: Side::South,
                sector: 3,
                tile: 7
            })
        );
        assert!(ChannelMap::load(dir.path().join("missing.txt")).is_err());
    }
}
