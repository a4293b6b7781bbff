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
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use duration_string::DurationString;
use serde::Deserialize;

use super::error::ConfigError;

const DEFAULT_SAMPLE_RATE: u32 = 44100;
const DEFAULT_MAX_BLOCK_FRAMES: usize = 1024;
const DEFAULT_MAX_VOICES: usize = 64;
const DEFAULT_MAX_NOTES: usize = 128;
const DEFAULT_MAX_STREAMS: usize = 90;
const DEFAULT_STREAM_BUFFER_FRAMES: usize = 65536;
const DEFAULT_RAM_CACHE_FRAMES: usize = 32768;
const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_DIAGNOSTIC_QUEUE_CAPACITY: usize = 256;
const DEFAULT_MAX_KEY_GROUP_EVENTS: usize = 64;
const DEFAULT_GLOBAL_VOLUME: f32 = 0.35;
const DEFAULT_CHANNELS: usize = 16;
const DEFAULT_SUSPEND_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_RT_PRIORITY: u8 = 70;

/// Prefix of environment variables overriding file values.
const ENV_PREFIX: &str = "RTSAMPLER";

/// Engine-wide settings. Every field is optional in YAML and falls back to a default.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct EngineConfig {
    /// Output sample rate in Hz (default: 44100).
    sample_rate: Option<u32>,
    /// Largest render block the engine preallocates for (default: 1024).
    max_block_frames: Option<usize>,
    /// Voice pool size (default: 64).
    max_voices: Option<usize>,
    /// Note pool size (default: 128).
    max_notes: Option<usize>,
    /// Number of disk stream slots (default: 90).
    max_streams: Option<usize>,
    /// Ring buffer size of each disk stream in frames (default: 65536).
    stream_buffer_frames: Option<usize>,
    /// Frames played from memory before a voice switches to disk (default: 32768).
    ram_cache_frames: Option<usize>,
    /// Capacity of the incoming event queue (default: 1024).
    event_queue_capacity: Option<usize>,
    /// Capacity of the diagnostic ring (default: 256).
    diagnostic_queue_capacity: Option<usize>,
    /// Key group fade signals per channel and cycle (default: 64).
    max_key_group_events: Option<usize>,
    /// Gain applied to the summed output (default: 0.35).
    global_volume: Option<f32>,
    /// Number of MIDI channels with their own instrument (default: 16).
    channels: Option<usize>,
    /// Seed for the random dimension. Unset seeds from entropy.
    random_seed: Option<u64>,
    /// How long suspension requests wait for the render thread, e.g. "2s".
    suspend_timeout: Option<String>,
    /// Real-time priority of the render thread (default: 70).
    rt_priority: Option<u8>,
}

impl EngineConfig {
    /// Loads the configuration from a YAML file, overlaid with `RTSAMPLER_*`
    /// environment variables.
    pub fn deserialize(path: &Path) -> Result<EngineConfig, ConfigError> {
        EngineConfig::load(Some(path))
    }

    /// Loads the configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: EngineConfig = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the engine unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("sample_rate", self.sample_rate() as usize),
            ("max_block_frames", self.max_block_frames()),
            ("max_voices", self.max_voices()),
            ("max_notes", self.max_notes()),
            ("stream_buffer_frames", self.stream_buffer_frames()),
            ("event_queue_capacity", self.event_queue_capacity()),
            ("channels", self.channels()),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.channels() > 16 {
            return Err(ConfigError::Invalid {
                field: "channels",
                reason: format!("{} exceeds the 16 MIDI channels", self.channels()),
            });
        }
        let volume = self.global_volume();
        if !volume.is_finite() || volume < 0.0 {
            return Err(ConfigError::Invalid {
                field: "global_volume",
                reason: format!("{} is not a usable gain", volume),
            });
        }
        self.suspend_timeout()?;
        Ok(())
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    pub fn with_max_block_frames(mut self, frames: usize) -> Self {
        self.max_block_frames = Some(frames);
        self
    }

    pub fn with_max_voices(mut self, max_voices: usize) -> Self {
        self.max_voices = Some(max_voices);
        self
    }

    pub fn with_max_notes(mut self, max_notes: usize) -> Self {
        self.max_notes = Some(max_notes);
        self
    }

    pub fn with_max_streams(mut self, max_streams: usize) -> Self {
        self.max_streams = Some(max_streams);
        self
    }

    pub fn with_stream_buffer_frames(mut self, frames: usize) -> Self {
        self.stream_buffer_frames = Some(frames);
        self
    }

    pub fn with_ram_cache_frames(mut self, frames: usize) -> Self {
        self.ram_cache_frames = Some(frames);
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_global_volume(mut self, volume: f32) -> Self {
        self.global_volume = Some(volume);
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    pub fn max_block_frames(&self) -> usize {
        self.max_block_frames.unwrap_or(DEFAULT_MAX_BLOCK_FRAMES)
    }

    pub fn max_voices(&self) -> usize {
        self.max_voices.unwrap_or(DEFAULT_MAX_VOICES)
    }

    pub fn max_notes(&self) -> usize {
        self.max_notes.unwrap_or(DEFAULT_MAX_NOTES)
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams.unwrap_or(DEFAULT_MAX_STREAMS)
    }

    pub fn stream_buffer_frames(&self) -> usize {
        self.stream_buffer_frames
            .unwrap_or(DEFAULT_STREAM_BUFFER_FRAMES)
    }

    pub fn ram_cache_frames(&self) -> usize {
        self.ram_cache_frames.unwrap_or(DEFAULT_RAM_CACHE_FRAMES)
    }

    pub fn event_queue_capacity(&self) -> usize {
        self.event_queue_capacity
            .unwrap_or(DEFAULT_EVENT_QUEUE_CAPACITY)
    }

    pub fn diagnostic_queue_capacity(&self) -> usize {
        self.diagnostic_queue_capacity
            .unwrap_or(DEFAULT_DIAGNOSTIC_QUEUE_CAPACITY)
    }

    pub fn max_key_group_events(&self) -> usize {
        self.max_key_group_events
            .unwrap_or(DEFAULT_MAX_KEY_GROUP_EVENTS)
    }

    pub fn global_volume(&self) -> f32 {
        self.global_volume.unwrap_or(DEFAULT_GLOBAL_VOLUME)
    }

    pub fn channels(&self) -> usize {
        self.channels.unwrap_or(DEFAULT_CHANNELS)
    }

    pub fn random_seed(&self) -> Option<u64> {
        self.random_seed
    }

    /// Returns how long suspension requests may wait (default: 2s).
    pub fn suspend_timeout(&self) -> Result<Duration, ConfigError> {
        match &self.suspend_timeout {
            Some(timeout) => Ok(DurationString::from_string(timeout.clone())
                .map_err(|source| ConfigError::Duration {
                    value: timeout.clone(),
                    source,
                })?
                .into()),
            None => Ok(DEFAULT_SUSPEND_TIMEOUT),
        }
    }

    pub fn rt_priority(&self) -> u8 {
        self.rt_priority.unwrap_or(DEFAULT_RT_PRIORITY)
    }
}
