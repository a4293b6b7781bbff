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
//! Static instrument data: regions, their dimensions and the leaf playback
//! configurations they select.
//!
//! Everything in here is built on non-real-time threads and is immutable once it
//! is handed to the engine.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

mod dimension;
mod dimension_region;
mod loader;
mod region;
mod sample;

pub use dimension::{Dimension, DimensionKind, SplitType};
pub use dimension_region::{
    DimensionParams, DimensionRegion, EgCancel, EgController, EnvelopeParams, FilterParams,
    LfoParams, LfoSource, VelocityCurve,
};
pub use loader::load_instrument;
pub use region::{apply_dimension_override, Region, RegionId, DIMENSION_REGION_COUNT, MAX_DIMENSIONS};
pub use sample::{Sample, SampleLoop};

/// Instrument generations, used by the engine to notice a swapped instrument.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Errors raised while building or loading an instrument.
#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("region uses {bits} dimension bits, at most 8 are allowed")]
    TooManyDimensionBits { bits: u32 },
    #[error("region has {0} dimensions, at most 8 are allowed")]
    TooManyDimensions(usize),
    #[error("invalid key range {low}..={high}")]
    InvalidKeyRange { low: u8, high: u8 },
    #[error("dimension {kind:?} cannot have {bits} bits and {zones} zones")]
    InvalidDimension {
        kind: DimensionKind,
        bits: u8,
        zones: u16,
    },
    #[error("upper limits for dimension {kind:?} must be ascending, one per zone")]
    InvalidUpperLimits { kind: DimensionKind },
    #[error("zone {zone} is out of range for dimension {kind:?}")]
    ZoneOutOfRange { kind: DimensionKind, zone: u32 },
    #[error("region has no {kind:?} dimension")]
    MissingDimension { kind: DimensionKind },
    #[error("dimension {0:?} appears more than once")]
    DuplicateDimension(DimensionKind),
    #[error("sample {0} is not defined")]
    UnknownSample(String),
    #[error("loop {start}+{length} is outside of sample {name}")]
    InvalidLoop {
        name: String,
        start: usize,
        length: usize,
    },
    #[error("unable to read sample {path}: {source}")]
    Sample {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yml::Error,
    },
}

/// A complete instrument: an ordered list of regions plus a key lookup table.
pub struct Instrument {
    name: String,
    regions: Vec<Region>,
    /// Region index per MIDI key. The first region covering a key wins.
    key_map: [Option<u16>; 128],
    /// Keys feeding the keyboard dimension position, if any.
    dimension_key_range: Option<(u8, u8)>,
    generation: u64,
}

impl Instrument {
    /// Creates an instrument from its regions.
    pub fn new(
        name: &str,
        regions: Vec<Region>,
        dimension_key_range: Option<(u8, u8)>,
    ) -> Result<Instrument, InstrumentError> {
        if let Some((low, high)) = dimension_key_range {
            if low > high || high > 127 {
                return Err(InstrumentError::InvalidKeyRange { low, high });
            }
        }

        let mut key_map = [None; 128];
        for (index, region) in regions.iter().enumerate() {
            for key in region.low_key()..=region.high_key() {
                let slot = &mut key_map[key as usize];
                if slot.is_none() {
                    *slot = Some(index as u16);
                }
            }
        }

        Ok(Instrument {
            name: name.to_string(),
            regions,
            key_map,
            dimension_key_range,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All regions in authoring order.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Returns the region playing `key`, along with its index.
    pub fn region_for_key(&self, key: u8) -> Option<(u16, &Region)> {
        let index = (*self.key_map.get(key as usize)?)?;
        self.regions.get(index as usize).map(|region| (index, region))
    }

    /// Returns a region by index.
    pub fn region(&self, index: u16) -> Option<&Region> {
        self.regions.get(index as usize)
    }

    /// The keyboard dimension position for `key`, in 0..1, if the key lies within the
    /// instrument's dimension key range.
    pub fn keyboard_position(&self, key: u8) -> Option<f32> {
        let (low, high) = self.dimension_key_range?;
        if key < low || key > high {
            return None;
        }
        Some((key - low) as f32 / (high - low + 1) as f32)
    }

    /// Unique per instrument instance.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("name", &self.name)
            .field("regions", &self.regions.len())
            .field("generation", &self.generation)
            .finish()
    }
}
