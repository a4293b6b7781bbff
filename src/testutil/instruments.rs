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
use std::error::Error;
use std::f32::consts::PI;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::instrument::{
    Dimension, DimensionKind, DimensionParams, DimensionRegion, Instrument, InstrumentError,
    Region, Sample, SampleLoop,
};

/// Frames in every fixture sample, about half a second at 44.1 kHz.
const SAMPLE_FRAMES: usize = 20_000;

/// Writes a mono 32-bit float sine to `path`.
pub fn write_sine_wav(
    path: &Path,
    frequency: f32,
    sample_rate: u32,
    frames: usize,
) -> Result<(), Box<dyn Error>> {
    let mut writer = WavWriter::new(
        File::create(path)?,
        WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        },
    )?;
    for frame in 0..frames {
        let t = frame as f32 / sample_rate as f32;
        writer.write_sample(0.5 * (2.0 * PI * frequency * t).sin())?;
    }
    writer.finalize()?;
    Ok(())
}

/// A mono sample holding 0.5 everywhere, optionally looping over its second half.
pub fn constant_sample(frames: usize, looped: bool) -> Result<Arc<Sample>, InstrumentError> {
    let sample = Sample::from_interleaved("constant", 1, 44100, vec![0.5; frames]);
    let sample = if looped {
        sample.with_loop(SampleLoop {
            start: frames / 2,
            length: frames - frames / 2,
        })?
    } else {
        sample
    };
    Ok(Arc::new(sample))
}

fn dimension_region(looped: bool) -> Result<DimensionRegion, InstrumentError> {
    Ok(DimensionRegion::new(
        Some(constant_sample(SAMPLE_FRAMES, looped)?),
        DimensionParams::default(),
    ))
}

/// One region over the whole keyboard with two layers, an eight zone velocity
/// split and a release trigger dimension.
pub fn release_trigger_instrument() -> Result<Arc<Instrument>, InstrumentError> {
    let mut region = Region::new(
        0,
        127,
        vec![
            Dimension::new(DimensionKind::Velocity, 3)?,
            Dimension::new(DimensionKind::ReleaseTrigger, 1)?,
        ],
    )?
    .with_layers(2);
    region.assign(&[None, None], dimension_region(false)?)?;
    Ok(Arc::new(Instrument::new("release", vec![region], None)?))
}

/// Keys 0 to 61 share key group 5; keys 62 and up have no key group. Samples loop.
pub fn key_group_instrument() -> Result<Arc<Instrument>, InstrumentError> {
    let mut grouped = Region::new(0, 61, Vec::new())?.with_key_group(5);
    grouped.assign(&[], dimension_region(true)?)?;
    let mut free = Region::new(62, 127, Vec::new())?;
    free.assign(&[], dimension_region(true)?)?;
    Ok(Arc::new(Instrument::new(
        "key groups",
        vec![grouped, free],
        None,
    )?))
}

/// One region with a four zone round robin dimension.
pub fn round_robin_instrument() -> Result<Arc<Instrument>, InstrumentError> {
    let mut region = Region::new(0, 127, vec![Dimension::new(DimensionKind::RoundRobin, 2)?])?;
    region.assign(&[None], dimension_region(true)?)?;
    Ok(Arc::new(Instrument::new("round robin", vec![region], None)?))
}

/// One region over `low..=high` with the given dimensions, every zone filled with a
/// looped sample.
pub fn dimension_instrument(
    low: u8,
    high: u8,
    dimensions: Vec<Dimension>,
    dimension_key_range: Option<(u8, u8)>,
) -> Result<Arc<Instrument>, InstrumentError> {
    let zones = vec![None; dimensions.len()];
    let mut region = Region::new(low, high, dimensions)?;
    region.assign(&zones, dimension_region(true)?)?;
    Ok(Arc::new(Instrument::new(
        "dimensions",
        vec![region],
        dimension_key_range,
    )?))
}

/// A release trigger region with a sample only in its release zone, so note-ons
/// find nothing to play.
pub fn release_zone_only_instrument() -> Result<Arc<Instrument>, InstrumentError> {
    let mut region = Region::new(0, 127, vec![Dimension::new(DimensionKind::ReleaseTrigger, 1)?])?;
    region.assign(&[Some(1)], dimension_region(false)?)?;
    Ok(Arc::new(Instrument::new("release only", vec![region], None)?))
}
