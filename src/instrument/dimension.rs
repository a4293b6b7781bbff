// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
//! Control axes that select a dimension region within a region.

use serde::{Deserialize, Serialize};

use super::InstrumentError;

/// The source of a dimension's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    None,
    SampleChannel,
    Layer,
    Velocity,
    ChannelAftertouch,
    ReleaseTrigger,
    Keyboard,
    RoundRobin,
    Random,
    SmartMidi,
    RoundRobinKeyboard,
    ModWheel,
    Breath,
    Foot,
    PortamentoTime,
    Effect1,
    Effect2,
    GenPurpose1,
    GenPurpose2,
    GenPurpose3,
    GenPurpose4,
    SustainPedal,
    Portamento,
    SostenutoPedal,
    SoftPedal,
    GenPurpose5,
    GenPurpose6,
    GenPurpose7,
    GenPurpose8,
    Effect1Depth,
    Effect2Depth,
    Effect3Depth,
    Effect4Depth,
    Effect5Depth,
    /// Anything the loader did not recognize.
    #[serde(other)]
    Unknown,
}

/// How a dimension value maps onto zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitType {
    /// The 0-127 range is divided into equally sized (or custom) zones.
    Normal,
    /// The value's low bits are the zone number.
    Bit,
}

impl DimensionKind {
    /// The MIDI controller feeding this dimension, if it is a plain CC axis.
    pub fn controller(self) -> Option<u8> {
        use DimensionKind::*;
        match self {
            ModWheel => Some(1),
            Breath => Some(2),
            Foot => Some(4),
            PortamentoTime => Some(5),
            Effect1 => Some(12),
            Effect2 => Some(13),
            GenPurpose1 => Some(16),
            GenPurpose2 => Some(17),
            GenPurpose3 => Some(18),
            GenPurpose4 => Some(19),
            SustainPedal => Some(64),
            Portamento => Some(65),
            SostenutoPedal => Some(66),
            SoftPedal => Some(67),
            GenPurpose5 => Some(80),
            GenPurpose6 => Some(81),
            GenPurpose7 => Some(82),
            GenPurpose8 => Some(83),
            Effect1Depth => Some(91),
            Effect2Depth => Some(92),
            Effect3Depth => Some(93),
            Effect4Depth => Some(94),
            Effect5Depth => Some(95),
            _ => Option::None,
        }
    }

    /// Returns how values of this kind are split into zones.
    pub fn split(self) -> SplitType {
        use DimensionKind::*;
        match self {
            SampleChannel | Layer | ReleaseTrigger | Keyboard | RoundRobin | Random
            | SmartMidi | RoundRobinKeyboard => SplitType::Bit,
            _ => SplitType::Normal,
        }
    }
}

/// One axis of a region: its kind, its share of the eight index bits and its zones.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    kind: DimensionKind,
    bits: u8,
    zones: u16,
    /// Inclusive upper value of each zone, replacing the equal split.
    upper_limits: Option<Vec<u8>>,
}

impl Dimension {
    /// Creates a dimension using every zone its bits can address.
    pub fn new(kind: DimensionKind, bits: u8) -> Result<Dimension, InstrumentError> {
        Dimension::with_zones(kind, bits, 1u16 << bits.min(8))
    }

    /// Creates a dimension with fewer zones than its bits could address.
    pub fn with_zones(kind: DimensionKind, bits: u8, zones: u16) -> Result<Dimension, InstrumentError> {
        if bits == 0 || bits > 8 || zones == 0 || zones > 1u16 << bits {
            return Err(InstrumentError::InvalidDimension { kind, bits, zones });
        }
        Ok(Dimension {
            kind,
            bits,
            zones,
            upper_limits: None,
        })
    }

    /// Replaces the equal split with explicit zone upper limits.
    pub fn with_upper_limits(mut self, limits: Vec<u8>) -> Result<Dimension, InstrumentError> {
        let ascending = limits.windows(2).all(|pair| pair[0] < pair[1]);
        if limits.len() != self.zones as usize || !ascending {
            return Err(InstrumentError::InvalidUpperLimits { kind: self.kind });
        }
        self.upper_limits = Some(limits);
        Ok(self)
    }

    pub fn kind(&self) -> DimensionKind {
        self.kind
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn zones(&self) -> u16 {
        self.zones
    }

    /// Width of one zone on the 0-127 scale for normally split dimensions.
    pub fn zone_size(&self) -> f32 {
        match self.kind.split() {
            SplitType::Normal => 128.0 / self.zones as f32,
            SplitType::Bit => 0.0,
        }
    }

    /// Maps a raw dimension value to a zone number within this dimension's bits.
    pub fn zone_for_value(&self, value: u32) -> u32 {
        let last = self.zones as u32 - 1;
        match self.kind.split() {
            SplitType::Bit => value & ((1u32 << self.bits) - 1),
            SplitType::Normal => match &self.upper_limits {
                Some(limits) => limits
                    .iter()
                    .position(|limit| value <= *limit as u32)
                    .map_or(last, |zone| zone as u32),
                None => ((value.min(127) as f32 / self.zone_size()) as u32).min(last),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_numbers() {
        assert_eq!(DimensionKind::ModWheel.controller(), Some(1));
        assert_eq!(DimensionKind::SustainPedal.controller(), Some(64));
        assert_eq!(DimensionKind::GenPurpose8.controller(), Some(83));
        assert_eq!(DimensionKind::Effect5Depth.controller(), Some(95));
        assert_eq!(DimensionKind::Velocity.controller(), None);
        assert_eq!(DimensionKind::Unknown.controller(), None);
        assert_eq!(DimensionKind::None.controller(), None);
    }

    #[test]
    fn test_velocity_zones_equal_split() {
        let dimension = Dimension::new(DimensionKind::Velocity, 3).expect("valid");
        assert_eq!(dimension.zones(), 8);
        assert_eq!(dimension.zone_for_value(0), 0);
        assert_eq!(dimension.zone_for_value(15), 0);
        assert_eq!(dimension.zone_for_value(16), 1);
        assert_eq!(dimension.zone_for_value(100), 6);
        assert_eq!(dimension.zone_for_value(127), 7);
        assert_eq!(dimension.zone_for_value(500), 7);
    }

    #[test]
    fn test_upper_limits() {
        let dimension = Dimension::with_zones(DimensionKind::ModWheel, 2, 3)
            .and_then(|dimension| dimension.with_upper_limits(vec![20, 90, 127]))
            .expect("valid");
        assert_eq!(dimension.zone_for_value(20), 0);
        assert_eq!(dimension.zone_for_value(21), 1);
        assert_eq!(dimension.zone_for_value(127), 2);
    }

    #[test]
    fn test_bit_split_masks_value() {
        let dimension = Dimension::new(DimensionKind::RoundRobin, 2).expect("valid");
        assert_eq!(dimension.zone_for_value(5), 1);
        assert_eq!(dimension.zone_for_value(7), 3);
    }

    #[test]
    fn test_invalid_dimensions() {
        assert!(Dimension::new(DimensionKind::Velocity, 0).is_err());
        assert!(Dimension::new(DimensionKind::Velocity, 9).is_err());
        assert!(Dimension::with_zones(DimensionKind::Layer, 1, 3).is_err());
        assert!(Dimension::new(DimensionKind::Velocity, 2)
            .and_then(|dimension| dimension.with_upper_limits(vec![10, 5, 60, 127]))
            .is_err());
    }

    #[test]
    fn test_unknown_kind_deserializes() {
        let kind: DimensionKind = serde_yml::from_str("theremin").expect("parses");
        assert_eq!(kind, DimensionKind::Unknown);
        let kind: DimensionKind = serde_yml::from_str("round_robin_keyboard").expect("parses");
        assert_eq!(kind, DimensionKind::RoundRobinKeyboard);
    }
}
