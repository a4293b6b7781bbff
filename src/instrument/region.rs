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
//! Key ranges and the dimension table that resolves to dimension regions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Dimension, DimensionKind, DimensionRegion, InstrumentError};

/// Size of the flat dimension region table.
pub const DIMENSION_REGION_COUNT: usize = 256;

/// Maximum number of dimensions, and of dimension bits, per region.
pub const MAX_DIMENSIONS: usize = 8;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide identity of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u64);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region-{}", self.0)
    }
}

/// Instrument data for one key range.
#[derive(Debug)]
pub struct Region {
    id: RegionId,
    low_key: u8,
    high_key: u8,
    key_group: u32,
    layers: u32,
    dimensions: Vec<Dimension>,
    /// Bit offset of each dimension within a dimension region index.
    shifts: Vec<u8>,
    dimension_regions: Box<[Option<DimensionRegion>]>,
}

impl Region {
    /// Creates an empty region. The layer count follows the layer dimension, if any.
    pub fn new(low_key: u8, high_key: u8, dimensions: Vec<Dimension>) -> Result<Region, InstrumentError> {
        if low_key > high_key || high_key > 127 {
            return Err(InstrumentError::InvalidKeyRange {
                low: low_key,
                high: high_key,
            });
        }
        if dimensions.len() > MAX_DIMENSIONS {
            return Err(InstrumentError::TooManyDimensions(dimensions.len()));
        }
        let bits: u32 = dimensions.iter().map(|dimension| dimension.bits() as u32).sum();
        if bits > MAX_DIMENSIONS as u32 {
            return Err(InstrumentError::TooManyDimensionBits { bits });
        }
        for (index, dimension) in dimensions.iter().enumerate() {
            let kind = dimension.kind();
            let inert = matches!(kind, DimensionKind::None | DimensionKind::Unknown);
            if !inert
                && dimensions[..index].iter().any(|other| other.kind() == kind)
            {
                return Err(InstrumentError::DuplicateDimension(kind));
            }
        }

        let mut shifts = Vec::with_capacity(dimensions.len());
        let mut shift = 0u8;
        for dimension in &dimensions {
            shifts.push(shift);
            shift += dimension.bits();
        }

        let layers = dimensions
            .iter()
            .find(|dimension| dimension.kind() == DimensionKind::Layer)
            .map_or(1, |dimension| dimension.zones() as u32);

        Ok(Region {
            id: RegionId(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed)),
            low_key,
            high_key,
            key_group: 0,
            layers,
            dimensions,
            shifts,
            dimension_regions: vec![None; DIMENSION_REGION_COUNT].into_boxed_slice(),
        })
    }

    /// Sets the exclusive key group. Zero means no group.
    pub fn with_key_group(mut self, key_group: u32) -> Region {
        self.key_group = key_group;
        self
    }

    /// Overrides the number of voices triggered per note.
    pub fn with_layers(mut self, layers: u32) -> Region {
        self.layers = layers;
        self
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn low_key(&self) -> u8 {
        self.low_key
    }

    pub fn high_key(&self) -> u8 {
        self.high_key
    }

    pub fn key_group(&self) -> u32 {
        self.key_group
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    /// Finds a dimension by kind, returning its position and descriptor.
    pub fn find_dimension(&self, kind: DimensionKind) -> Option<(usize, &Dimension)> {
        self.dimensions
            .iter()
            .enumerate()
            .find(|(_, dimension)| dimension.kind() == kind)
    }

    /// Whether notes on this region can launch release-triggered voices.
    pub fn has_release_trigger(&self) -> bool {
        self.find_dimension(DimensionKind::ReleaseTrigger).is_some()
    }

    /// Resolves per-dimension values (in dimension order) to a flat table index.
    pub fn dimension_region_index(&self, values: &[u32; MAX_DIMENSIONS]) -> u8 {
        let mut index = 0u32;
        for ((dimension, shift), value) in self.dimensions.iter().zip(&self.shifts).zip(values) {
            index |= dimension.zone_for_value(*value) << shift;
        }
        (index & 0xff) as u8
    }

    /// Mask and bits that force `kind` onto `zone`, for use as a note override.
    pub fn zone_override(&self, kind: DimensionKind, zone: u32) -> Option<(u8, u8)> {
        let (position, dimension) = self.find_dimension(kind)?;
        let shift = self.shifts[position];
        let mask = (((1u32 << dimension.bits()) - 1) << shift) as u8;
        let bits = ((zone << shift) as u8) & mask;
        Some((mask, bits))
    }

    /// The dimension region at a flat index, if one was authored there.
    pub fn dimension_region(&self, index: u8) -> Option<&DimensionRegion> {
        self.dimension_regions[index as usize].as_ref()
    }

    /// Iterates over authored dimension regions along with their indices.
    pub fn dimension_regions(&self) -> impl Iterator<Item = (u8, &DimensionRegion)> {
        self.dimension_regions
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.as_ref().map(|entry| (index as u8, entry)))
    }

    /// Stores `dimension_region` at every index matching `zones`, given in dimension
    /// order. A `None` zone covers every zone of that dimension.
    pub fn assign(
        &mut self,
        zones: &[Option<u32>],
        dimension_region: DimensionRegion,
    ) -> Result<(), InstrumentError> {
        let mut choices: Vec<Vec<u32>> = Vec::with_capacity(self.dimensions.len());
        for (position, dimension) in self.dimensions.iter().enumerate() {
            match zones.get(position).copied().flatten() {
                Some(zone) if zone >= dimension.zones() as u32 => {
                    return Err(InstrumentError::ZoneOutOfRange {
                        kind: dimension.kind(),
                        zone,
                    })
                }
                Some(zone) => choices.push(vec![zone]),
                None => choices.push((0..dimension.zones() as u32).collect()),
            }
        }

        let mut indices = vec![0u32];
        for (choice, shift) in choices.iter().zip(&self.shifts) {
            indices = indices
                .iter()
                .flat_map(|index| choice.iter().map(move |zone| index | (zone << shift)))
                .collect();
        }
        for index in indices {
            self.dimension_regions[index as usize] = Some(dimension_region.clone());
        }
        Ok(())
    }
}

/// Replaces the bits selected by `mask` in `index` with the matching bits of `bits`.
pub fn apply_dimension_override(index: u8, mask: u8, bits: u8) -> u8 {
    (index & !mask) | (bits & mask)
}
