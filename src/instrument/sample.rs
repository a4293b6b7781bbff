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
//! Decoded sample data.
//!
//! Samples are decoded to interleaved f32 once at load time. They keep their
//! native sample rate; voices fold the rate ratio into their pitch.

use std::path::Path;
use std::sync::Arc;

use hound::{SampleFormat, WavReader};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::InstrumentError;

/// A sustain loop in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SampleLoop {
    pub start: usize,
    pub length: usize,
}

impl SampleLoop {
    /// The first frame after the loop.
    pub fn end(&self) -> usize {
        self.start + self.length
    }
}

/// Decoded, immutable sample data shared between voices and the disk thread.
pub struct Sample {
    name: String,
    channels: u16,
    sample_rate: u32,
    frames: usize,
    /// Interleaved sample data.
    data: Arc<[f32]>,
    sample_loop: Option<SampleLoop>,
}

impl Sample {
    /// Creates a sample from interleaved data. Trailing partial frames are dropped.
    pub fn from_interleaved(name: &str, channels: u16, sample_rate: u32, mut data: Vec<f32>) -> Sample {
        let channels = channels.max(1);
        let frames = data.len() / channels as usize;
        data.truncate(frames * channels as usize);
        Sample {
            name: name.to_string(),
            channels,
            sample_rate,
            frames,
            data: data.into(),
            sample_loop: None,
        }
    }

    /// Sets the sustain loop.
    pub fn with_loop(mut self, sample_loop: SampleLoop) -> Result<Sample, InstrumentError> {
        if sample_loop.length == 0 || sample_loop.end() > self.frames {
            return Err(InstrumentError::InvalidLoop {
                name: self.name,
                start: sample_loop.start,
                length: sample_loop.length,
            });
        }
        self.sample_loop = Some(sample_loop);
        Ok(self)
    }

    /// Decodes a WAV file.
    pub fn load_wav(name: &str, path: &Path) -> Result<Sample, InstrumentError> {
        let sample_error = |source| InstrumentError::Sample {
            path: path.to_path_buf(),
            source,
        };
        let reader = WavReader::open(path).map_err(sample_error)?;
        let spec = reader.spec();

        let data = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<_>, _>>()
                .map_err(sample_error)?,
            SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|sample| sample.map(|sample| sample as f32 * scale))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(sample_error)?
            }
        };

        let sample = Sample::from_interleaved(name, spec.channels, spec.sample_rate, data);
        info!(
            sample = name,
            path = ?path,
            channels = sample.channels,
            sample_rate = sample.sample_rate,
            frames = sample.frames,
            memory_kb = sample.memory_size() / 1024,
            "Sample loaded"
        );
        Ok(sample)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Total length in frames.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn sample_loop(&self) -> Option<SampleLoop> {
        self.sample_loop
    }

    /// The shared interleaved data.
    pub fn data(&self) -> &Arc<[f32]> {
        &self.data
    }

    /// A stereo frame. Mono samples are duplicated, extra channels ignored, and
    /// frames past the end are silent.
    #[inline]
    pub fn frame(&self, frame: usize) -> (f32, f32) {
        if frame >= self.frames {
            return (0.0, 0.0);
        }
        let base = frame * self.channels as usize;
        let left = self.data[base];
        if self.channels == 1 {
            (left, left)
        } else {
            (left, self.data[base + 1])
        }
    }

    /// Returns the memory size in bytes.
    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

impl std::fmt::Debug for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("name", &self.name)
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("frames", &self.frames)
            .field("sample_loop", &self.sample_loop)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use hound::{WavSpec, WavWriter};

    use super::*;

    #[test]
    fn test_frame_access() {
        let mono = Sample::from_interleaved("mono", 1, 44100, vec![0.1, 0.2, 0.3]);
        assert_eq!(mono.frames(), 3);
        assert_eq!(mono.frame(1), (0.2, 0.2));
        assert_eq!(mono.frame(3), (0.0, 0.0));

        let stereo = Sample::from_interleaved("stereo", 2, 44100, vec![0.1, -0.1, 0.2, -0.2, 0.3]);
        assert_eq!(stereo.frames(), 2);
        assert_eq!(stereo.frame(1), (0.2, -0.2));
    }

    #[test]
    fn test_loop_validation() {
        let sample = || Sample::from_interleaved("s", 1, 44100, vec![0.0; 100]);
        assert!(sample()
            .with_loop(SampleLoop {
                start: 10,
                length: 90
            })
            .is_ok());
        assert!(sample()
            .with_loop(SampleLoop {
                start: 10,
                length: 91
            })
            .is_err());
        assert!(sample()
            .with_loop(SampleLoop {
                start: 0,
                length: 0
            })
            .is_err());
    }

    #[test]
    fn test_load_int_wav() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("int.wav");
        let mut writer = WavWriter::create(
            &path,
            WavSpec {
                channels: 2,
                sample_rate: 22050,
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            },
        )?;
        for value in [16384i16, -16384, 0, 32767] {
            writer.write_sample(value)?;
        }
        writer.finalize()?;

        let sample = Sample::load_wav("int", &path)?;
        assert_eq!(sample.channels(), 2);
        assert_eq!(sample.sample_rate(), 22050);
        assert_eq!(sample.frames(), 2);
        assert_eq!(sample.frame(0), (0.5, -0.5));
        Ok(())
    }

    #[test]
    fn test_load_missing_wav() {
        let result = Sample::load_wav("missing", Path::new("/nonexistent/missing.wav"));
        assert!(matches!(result, Err(InstrumentError::Sample { .. })));
    }
}
