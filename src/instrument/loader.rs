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
//! Loads instruments from YAML descriptions.
//!
//! ```yaml
//! name: Piano
//! dimension_key_range: [21, 108]
//! samples:
//!   c4:
//!     file: samples/c4.wav
//!     loop: { start: 1000, length: 20000 }
//! regions:
//!   - keys: [0, 127]
//!     key_group: 0
//!     dimensions:
//!       - kind: velocity
//!         bits: 2
//!       - kind: release_trigger
//!         bits: 1
//!     dimension_regions:
//!       - zones: { release_trigger: 0 }
//!         sample: c4
//!         unity_note: 60
//! ```
//!
//! Zones left out of a dimension region's `zones` map cover every zone of that
//! dimension.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use super::{
    Dimension, DimensionKind, DimensionParams, DimensionRegion, Instrument, InstrumentError,
    Region, Sample, SampleLoop,
};

#[derive(Deserialize)]
struct InstrumentFile {
    name: String,
    #[serde(default)]
    dimension_key_range: Option<(u8, u8)>,
    #[serde(default)]
    samples: HashMap<String, SampleFile>,
    regions: Vec<RegionFile>,
}

#[derive(Deserialize)]
struct SampleFile {
    file: PathBuf,
    #[serde(default, rename = "loop")]
    sample_loop: Option<SampleLoop>,
}

#[derive(Deserialize)]
struct RegionFile {
    keys: (u8, u8),
    #[serde(default)]
    key_group: u32,
    #[serde(default)]
    layers: Option<u32>,
    #[serde(default)]
    dimensions: Vec<DimensionFile>,
    #[serde(default)]
    dimension_regions: Vec<DimensionRegionFile>,
}

#[derive(Deserialize)]
struct DimensionFile {
    kind: DimensionKind,
    bits: u8,
    #[serde(default)]
    zones: Option<u16>,
    #[serde(default)]
    upper_limits: Option<Vec<u8>>,
}

#[derive(Deserialize)]
struct DimensionRegionFile {
    #[serde(default)]
    zones: HashMap<DimensionKind, u32>,
    #[serde(default)]
    sample: Option<String>,
    #[serde(flatten)]
    params: DimensionParams,
}

/// Reads an instrument description and decodes every sample it references.
pub fn load_instrument(path: &Path) -> Result<Arc<Instrument>, InstrumentError> {
    let contents = fs::read_to_string(path).map_err(|source| InstrumentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: InstrumentFile =
        serde_yml::from_str(&contents).map_err(|source| InstrumentError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut samples = HashMap::with_capacity(file.samples.len());
    for (name, sample_file) in &file.samples {
        let sample_path = if sample_file.file.is_absolute() {
            sample_file.file.clone()
        } else {
            base.join(&sample_file.file)
        };
        let mut sample = Sample::load_wav(name, &sample_path)?;
        if let Some(sample_loop) = sample_file.sample_loop {
            sample = sample.with_loop(sample_loop)?;
        }
        samples.insert(name.clone(), Arc::new(sample));
    }

    let regions = file
        .regions
        .into_iter()
        .map(|region| build_region(region, &samples))
        .collect::<Result<Vec<_>, _>>()?;

    let instrument = Instrument::new(&file.name, regions, file.dimension_key_range)?;
    info!(
        instrument = instrument.name(),
        regions = instrument.regions().len(),
        samples = samples.len(),
        "Instrument loaded"
    );
    Ok(Arc::new(instrument))
}

fn build_region(
    file: RegionFile,
    samples: &HashMap<String, Arc<Sample>>,
) -> Result<Region, InstrumentError> {
    let dimensions = file
        .dimensions
        .into_iter()
        .map(|dimension| {
            let built = match dimension.zones {
                Some(zones) => Dimension::with_zones(dimension.kind, dimension.bits, zones)?,
                None => Dimension::new(dimension.kind, dimension.bits)?,
            };
            match dimension.upper_limits {
                Some(limits) => built.with_upper_limits(limits),
                None => Ok(built),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut region = Region::new(file.keys.0, file.keys.1, dimensions)?.with_key_group(file.key_group);
    if let Some(layers) = file.layers {
        region = region.with_layers(layers);
    }

    for entry in file.dimension_regions {
        for kind in entry.zones.keys() {
            if region.find_dimension(*kind).is_none() {
                return Err(InstrumentError::MissingDimension { kind: *kind });
            }
        }
        let zones: Vec<Option<u32>> = region
            .dimensions()
            .iter()
            .map(|dimension| entry.zones.get(&dimension.kind()).copied())
            .collect();

        let sample = match entry.sample {
            Some(name) => Some(
                samples
                    .get(&name)
                    .cloned()
                    .ok_or(InstrumentError::UnknownSample(name))?,
            ),
            None => None,
        };
        region.assign(&zones, DimensionRegion::new(sample, entry.params))?;
    }

    debug!(
        region = %region.id(),
        low_key = region.low_key(),
        high_key = region.high_key(),
        dimensions = region.dimensions().len(),
        "Region built"
    );
    Ok(region)
}
